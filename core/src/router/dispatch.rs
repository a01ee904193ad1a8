// Router dispatch — one handler per payload kind
//
// `check` runs for every payload of an envelope before anything is applied,
// so a rejected envelope leaves the router untouched. `apply` then produces
// the response payload and queues deliveries for other sessions.
// `apply_envelope` orders an envelope so every step that can still fail runs
// before the first mutation: reads, then all uploads in one store, then the
// writes, then the mailbox poll.

use super::state::RouterState;
use crate::command::CommandError;
use crate::entity::{
    ClientComponent, Entity, GroupComponent, MailboxComponent, MuteComponent, SessionComponent,
    ShareComponent,
};
use crate::message::packer::PAYLOAD_HEADER_SIZE;
use crate::message::{
    Body, BrowseBody, ChatBody, Data, FileEntry, JoinBody, MessageBody, MuteBody, PingBody,
    QuitBody, SearchBody, SearchResult, ShareBody, TransferBody, TunnelBody, MAX_ENVELOPE_SIZE,
};
use std::collections::HashSet;
use tracing::{debug, trace};

/// Results returned for one search
pub const MAX_SEARCH_RESULTS: usize = 256;

/// Deliveries batched behind one ping response
pub const MAX_DELIVERIES_PER_POLL: usize = 64;

/// Bytes of deliveries batched behind one ping response
const DELIVERY_BUDGET: usize = MAX_ENVELOPE_SIZE / 2;

/// Characters that split a search keyword and a file path into tokens
const SEPARATORS: &[char] = &[' ', '.', '_', '-', '(', ')', '{', '}', '[', ']', '\'', '"', '\t'];

/// Response for one payload plus the deliveries that follow it
#[derive(Debug)]
pub struct Reply {
    pub response: Data,
    pub deliveries: Vec<Data>,
}

impl Reply {
    fn of(body: Body) -> Self {
        Self {
            response: Data::response(body),
            deliveries: Vec::new(),
        }
    }
}

fn client_of(entity: &Entity) -> Result<std::sync::Arc<ClientComponent>, CommandError> {
    entity
        .get::<ClientComponent>()
        .ok_or(CommandError::MissingComponent("client"))
}

fn group_of(entity: &Entity) -> Option<String> {
    entity.get::<GroupComponent>().and_then(|group| group.id())
}

/// Target session of a client-addressed request. Never the caller.
fn target(
    state: &RouterState,
    caller: &Entity,
    client_id: &str,
) -> Result<(String, std::sync::Arc<Entity>), CommandError> {
    if client_of(caller)?.client_id == client_id {
        return Err(CommandError::Validation("target is the caller".into()));
    }
    state
        .session_for_client(client_id)
        .ok_or_else(|| CommandError::Validation(format!("unknown client {}", client_id)))
}

// ============================================================================
// CHECK
// ============================================================================

/// Read-only preconditions for one payload.
pub fn check(state: &RouterState, session: &Entity, data: &Data) -> Result<(), CommandError> {
    match &data.body {
        Body::Handshake(_) => Err(CommandError::Validation(
            "handshake inside an established session".into(),
        )),
        Body::Browse(b) => {
            let (_, peer) = target(state, session, &b.client_id)?;
            let caller_group = group_of(session);
            if caller_group.is_none() || caller_group != group_of(&peer) {
                return Err(CommandError::Validation(format!(
                    "client {} is not in the caller's group",
                    b.client_id
                )));
            }
            Ok(())
        }
        Body::Chat(_) => match group_of(session) {
            Some(_) => Ok(()),
            None => Err(CommandError::MissingComponent("group")),
        },
        Body::Message(b) => target(state, session, &b.client_id).map(|_| ()),
        Body::Tunnel(b) => target(state, session, &b.client_id).map(|_| ()),
        Body::Download(b) => {
            if !state.has_chunk(&b.transfer_id, b.chunk_id) {
                return Err(CommandError::Validation(format!(
                    "no chunk {} in transfer {}",
                    b.chunk_id, b.transfer_id
                )));
            }
            Ok(())
        }
        Body::Upload(b) => {
            let owner = session
                .get::<SessionComponent>()
                .and_then(|component| component.id())
                .ok_or(CommandError::MissingComponent("session"))?;
            state.can_store(&owner, &[(b.transfer_id.as_str(), b.chunk_id, b.chunk.len())])
        }
        Body::Join(_)
        | Body::Share(_)
        | Body::Search(_)
        | Body::Mute(_)
        | Body::Ping(_)
        | Body::Quit(_) => Ok(()),
    }
}

/// Every upload of an envelope against the transfer buffer at once.
pub fn check_uploads(
    state: &RouterState,
    session_id: &str,
    payloads: &[Data],
) -> Result<(), CommandError> {
    let chunks: Vec<(&str, u64, usize)> = payloads
        .iter()
        .filter_map(|data| match &data.body {
            Body::Upload(b) => Some((b.transfer_id.as_str(), b.chunk_id, b.chunk.len())),
            _ => None,
        })
        .collect();
    if chunks.len() < 2 {
        return Ok(());
    }
    state.can_store(session_id, &chunks)
}

/// Apply order within one envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Read,
    Upload,
    Write,
    Poll,
    Quit,
}

impl Stage {
    fn of(body: &Body) -> Self {
        match body {
            Body::Search(_) | Body::Browse(_) | Body::Download(_) => Stage::Read,
            Body::Upload(_) => Stage::Upload,
            Body::Ping(_) => Stage::Poll,
            Body::Quit(_) => Stage::Quit,
            _ => Stage::Write,
        }
    }
}

/// Apply a checked envelope. Returns the responses in payload order followed
/// by the deliveries. Reads see the state from before the envelope, the same
/// state `check` saw. An error leaves the router unchanged.
pub fn apply_envelope(
    state: &RouterState,
    session_id: &str,
    session: &Entity,
    payloads: Vec<Data>,
) -> Result<Vec<Data>, CommandError> {
    let stages: Vec<Stage> = payloads.iter().map(|data| Stage::of(&data.body)).collect();
    let mut slots: Vec<Option<Data>> = payloads.into_iter().map(Some).collect();
    let mut responses: Vec<Option<Data>> = slots.iter().map(|_| None).collect();
    let mut deliveries = Vec::new();

    let indexes = |stage: Stage| -> Vec<usize> {
        (0..stages.len()).filter(|&i| stages[i] == stage).collect()
    };

    for index in indexes(Stage::Read) {
        if let Some(data) = slots[index].take() {
            responses[index] = Some(apply(state, session_id, session, data)?.response);
        }
    }

    let mut chunks = Vec::new();
    for index in indexes(Stage::Upload) {
        if let Some(Body::Upload(b)) = slots[index].take().map(|data| data.body) {
            responses[index] = Some(Data::response(Body::Upload(TransferBody {
                transfer_id: b.transfer_id.clone(),
                chunk_id: b.chunk_id,
                chunk: Vec::new(),
            })));
            chunks.push((b.transfer_id, b.chunk_id, b.chunk));
        }
    }
    if !chunks.is_empty() {
        state.store_chunks(session_id, chunks)?;
    }

    for stage in [Stage::Write, Stage::Poll, Stage::Quit] {
        for index in indexes(stage) {
            if let Some(data) = slots[index].take() {
                let reply = apply(state, session_id, session, data)?;
                responses[index] = Some(reply.response);
                deliveries.extend(reply.deliveries);
            }
        }
    }

    let mut out: Vec<Data> = responses.into_iter().flatten().collect();
    out.extend(deliveries);
    Ok(out)
}

// ============================================================================
// APPLY
// ============================================================================

pub fn apply(
    state: &RouterState,
    session_id: &str,
    session: &Entity,
    data: Data,
) -> Result<Reply, CommandError> {
    trace!("Session {} {} request", session_id, data.kind().name());

    match data.body {
        Body::Handshake(_) => Err(CommandError::Validation(
            "handshake inside an established session".into(),
        )),
        Body::Join(b) => {
            let members = state.join_group(session_id, session, &b.group_id);
            debug!("Session {} joined group ({} members)", session_id, members);
            Ok(Reply::of(Body::Join(JoinBody {
                group_id: b.group_id,
                members: members as u32,
            })))
        }
        Body::Share(b) => {
            let files = dedup_files(b.files);
            let accepted = files.len() as u32;
            session.add(ShareComponent::default()).replace(files);
            Ok(Reply::of(Body::Share(ShareBody {
                files: Vec::new(),
                accepted,
            })))
        }
        Body::Search(b) => {
            let results = search(state, session_id, session, &b.keyword);
            debug!("Search {} matched {} files", b.search_id, results.len());
            Ok(Reply::of(Body::Search(SearchBody {
                search_id: b.search_id,
                keyword: b.keyword,
                results,
            })))
        }
        Body::Browse(b) => {
            let (_, peer) = target(state, session, &b.client_id)?;
            let entries = peer
                .get::<ShareComponent>()
                .map(|share| {
                    share.with_files(|files| {
                        files
                            .iter()
                            .filter(|file| file.path.starts_with(&b.path))
                            .cloned()
                            .collect()
                    })
                })
                .unwrap_or_default();
            Ok(Reply::of(Body::Browse(BrowseBody {
                client_id: b.client_id,
                path: b.path,
                entries,
            })))
        }
        Body::Upload(b) => {
            state.store_chunk(session_id, &b.transfer_id, b.chunk_id, b.chunk)?;
            Ok(Reply::of(Body::Upload(TransferBody {
                transfer_id: b.transfer_id,
                chunk_id: b.chunk_id,
                chunk: Vec::new(),
            })))
        }
        Body::Download(b) => {
            let chunk = state
                .fetch_chunk(&b.transfer_id, b.chunk_id)
                .ok_or_else(|| CommandError::Validation("chunk no longer available".into()))?;
            Ok(Reply::of(Body::Download(TransferBody {
                transfer_id: b.transfer_id,
                chunk_id: b.chunk_id,
                chunk,
            })))
        }
        Body::Tunnel(b) => {
            let sender = client_of(session)?;
            deliver_to(
                state,
                &b.client_id,
                Data::response(Body::Tunnel(TunnelBody {
                    client_id: sender.client_id.clone(),
                    transfer_id: b.transfer_id.clone(),
                    chunk_id: b.chunk_id,
                    chunk: b.chunk,
                })),
            );
            Ok(Reply::of(Body::Tunnel(TunnelBody {
                client_id: b.client_id,
                transfer_id: b.transfer_id,
                chunk_id: b.chunk_id,
                chunk: Vec::new(),
            })))
        }
        Body::Chat(b) => {
            let group_id = group_of(session).ok_or(CommandError::MissingComponent("group"))?;
            let sender = client_of(session)?;
            let delivery = Data::response(Body::Chat(ChatBody {
                client_id: sender.client_id.clone(),
                name: sender.name.clone(),
                text: b.text,
            }));

            let mut delivered = 0;
            for (_, member) in state.group_members(&group_id, session_id) {
                let muted = member
                    .get::<MuteComponent>()
                    .map(|mute| mute.is_muted(&sender.client_id))
                    .unwrap_or(false);
                if !muted && state.deliver(&member, delivery.clone()) {
                    delivered += 1;
                }
            }
            debug!("Chat from {} delivered to {} members", sender.client_id, delivered);
            Ok(Reply::of(Body::Chat(ChatBody::default())))
        }
        Body::Message(b) => {
            let sender = client_of(session)?;
            deliver_to(
                state,
                &b.client_id,
                Data::response(Body::Message(MessageBody {
                    client_id: sender.client_id.clone(),
                    text: b.text,
                })),
            );
            Ok(Reply::of(Body::Message(MessageBody {
                client_id: b.client_id,
                text: String::new(),
            })))
        }
        Body::Mute(b) => {
            session
                .add(MuteComponent::default())
                .set(&b.client_id, b.mute);
            Ok(Reply::of(Body::Mute(MuteBody {
                client_id: b.client_id,
                mute: b.mute,
            })))
        }
        Body::Ping(_) => {
            let deliveries = session
                .get::<MailboxComponent>()
                .map(|mailbox| drain_mailbox(&mailbox))
                .unwrap_or_default();
            Ok(Reply {
                response: Data::response(Body::Ping(PingBody {
                    pending: deliveries.len() as u32,
                })),
                deliveries,
            })
        }
        Body::Quit(_) => {
            state.close_session(session_id);
            Ok(Reply::of(Body::Quit(QuitBody {})))
        }
    }
}

/// Queue `data` for a checked target. A target that left since the check
/// loses the delivery like a full mailbox does.
fn deliver_to(state: &RouterState, client_id: &str, data: Data) {
    match state.session_for_client(client_id) {
        Some((_, peer)) => {
            state.deliver(&peer, data);
        }
        None => debug!("Client {} left before delivery", client_id),
    }
}

/// Take queued deliveries that fit one poll.
fn drain_mailbox(mailbox: &MailboxComponent) -> Vec<Data> {
    let mut budget = DELIVERY_BUDGET;
    let mut first = true;
    mailbox.drain_while(MAX_DELIVERIES_PER_POLL, |data| {
        let size = data
            .body
            .encode()
            .map(|body| body.len() + PAYLOAD_HEADER_SIZE)
            .unwrap_or(usize::MAX);
        // Always hand out at least one so a large chunk cannot wedge the queue
        if first || size <= budget {
            first = false;
            budget = budget.saturating_sub(size);
            true
        } else {
            false
        }
    })
}

/// Keep the first entry for every path.
fn dedup_files(files: Vec<FileEntry>) -> Vec<FileEntry> {
    let mut seen = HashSet::new();
    files
        .into_iter()
        .filter(|file| seen.insert(file.path.clone()))
        .collect()
}

// ============================================================================
// SEARCH
// ============================================================================

/// Lowercased tokens of a keyword or path.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(SEPARATORS)
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// A keyword wrapped in double quotes must match every token.
fn is_exact(keyword: &str) -> bool {
    let keyword = keyword.trim();
    keyword.len() >= 2 && keyword.starts_with('"') && keyword.ends_with('"')
}

/// Number of keyword tokens found in `path`, or `None` when it does not match.
pub fn match_weight(tokens: &[String], exact: bool, path: &str) -> Option<u32> {
    if tokens.is_empty() {
        return None;
    }
    let path = path.to_lowercase();
    let weight = tokens
        .iter()
        .filter(|token| path.contains(token.as_str()))
        .count();

    let matched = if exact {
        weight == tokens.len()
    } else {
        weight > 0
    };
    matched.then_some(weight as u32)
}

fn search(
    state: &RouterState,
    session_id: &str,
    session: &Entity,
    keyword: &str,
) -> Vec<SearchResult> {
    let Some(group_id) = group_of(session) else {
        return Vec::new();
    };
    let tokens = tokenize(keyword);
    let exact = is_exact(keyword);

    let mut results = Vec::new();
    for (_, member) in state.group_members(&group_id, session_id) {
        let (Some(client), Some(share)) = (
            member.get::<ClientComponent>(),
            member.get::<ShareComponent>(),
        ) else {
            continue;
        };
        share.with_files(|files| {
            for file in files {
                if let Some(weight) = match_weight(&tokens, exact, &file.path) {
                    results.push(SearchResult {
                        client_id: client.client_id.clone(),
                        name: client.name.clone(),
                        file: file.clone(),
                        weight,
                    });
                }
            }
        });
    }

    results.sort_by(|a, b| {
        b.weight
            .cmp(&a.weight)
            .then_with(|| a.file.path.cmp(&b.file.path))
            .then_with(|| a.client_id.cmp(&b.client_id))
    });
    results.truncate(MAX_SEARCH_RESULTS);
    results
}
