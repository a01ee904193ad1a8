// Entity components shared by clients and routers

use crate::crypto::CipherChain;
use crate::message::{Data, FileEntry};
use crate::session::{NonceCounter, ReplayGuard, Timer};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Who this entity is
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientComponent {
    pub client_id: String,
    pub name: String,
}

impl ClientComponent {
    pub fn new(client_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            name: name.into(),
        }
    }
}

/// Session binding: id, outbound nonce counter, inbound replay guard and
/// the cipher chain that protects this session's traffic.
#[derive(Debug)]
pub struct SessionComponent {
    session_id: RwLock<Option<String>>,
    pub nonce: NonceCounter,
    pub replay: ReplayGuard,
    pub chain: Arc<CipherChain>,
}

impl SessionComponent {
    pub fn new(chain: Arc<CipherChain>) -> Self {
        Self {
            session_id: RwLock::new(None),
            nonce: NonceCounter::new(),
            replay: ReplayGuard::new(),
            chain,
        }
    }

    pub fn with_id(chain: Arc<CipherChain>, session_id: impl Into<String>) -> Self {
        let session = Self::new(chain);
        session.set_id(session_id);
        session
    }

    pub fn id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    pub fn set_id(&self, session_id: impl Into<String>) {
        *self.session_id.write() = Some(session_id.into());
    }

    pub fn clear_id(&self) {
        *self.session_id.write() = None;
    }
}

/// Group membership (hex fingerprint of the group passphrase key)
#[derive(Debug, Default)]
pub struct GroupComponent {
    group_id: RwLock<Option<String>>,
}

impl GroupComponent {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: RwLock::new(Some(group_id.into())),
        }
    }

    pub fn id(&self) -> Option<String> {
        self.group_id.read().clone()
    }

    pub fn set_id(&self, group_id: impl Into<String>) {
        *self.group_id.write() = Some(group_id.into());
    }

    pub fn is_member(&self, group_id: &str) -> bool {
        self.group_id.read().as_deref() == Some(group_id)
    }
}

/// Liveness timer, restarted on every accepted request
#[derive(Debug)]
pub struct TimerComponent {
    timer: Mutex<Timer>,
}

impl Default for TimerComponent {
    fn default() -> Self {
        Self {
            timer: Mutex::new(Timer::started()),
        }
    }
}

impl TimerComponent {
    pub fn touch(&self) {
        self.timer.lock().restart();
    }

    pub fn stop(&self) {
        self.timer.lock().stop();
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.timer.lock().elapsed()
    }

    pub fn expired(&self, timeout: Duration) -> bool {
        self.timer.lock().expired(timeout)
    }
}

/// Client ids whose chat this entity does not want delivered
#[derive(Debug, Default)]
pub struct MuteComponent {
    muted: RwLock<HashSet<String>>,
}

impl MuteComponent {
    pub fn set(&self, client_id: &str, mute: bool) {
        let mut muted = self.muted.write();
        if mute {
            muted.insert(client_id.to_string());
        } else {
            muted.remove(client_id);
        }
    }

    pub fn is_muted(&self, client_id: &str) -> bool {
        self.muted.read().contains(client_id)
    }

    pub fn len(&self) -> usize {
        self.muted.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.muted.read().is_empty()
    }
}

/// Files this entity has published
#[derive(Debug, Default)]
pub struct ShareComponent {
    files: RwLock<Vec<FileEntry>>,
}

impl ShareComponent {
    /// Replace the published list.
    pub fn replace(&self, files: Vec<FileEntry>) {
        *self.files.write() = files;
    }

    pub fn files(&self) -> Vec<FileEntry> {
        self.files.read().clone()
    }

    pub fn with_files<R>(&self, f: impl FnOnce(&[FileEntry]) -> R) -> R {
        f(&self.files.read())
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

/// Queued deliveries (chat, private messages, tunnel chunks) waiting for
/// the next poll
#[derive(Debug)]
pub struct MailboxComponent {
    queue: Mutex<VecDeque<Data>>,
    capacity: usize,
}

impl Default for MailboxComponent {
    fn default() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }
}

impl MailboxComponent {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Queue a delivery. Returns false when the mailbox is full.
    pub fn push(&self, data: Data) -> bool {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            return false;
        }
        queue.push_back(data);
        true
    }

    /// Take up to `max` deliveries, oldest first.
    pub fn drain(&self, max: usize) -> Vec<Data> {
        let mut queue = self.queue.lock();
        let count = max.min(queue.len());
        queue.drain(..count).collect()
    }

    /// Take deliveries oldest first while `take` accepts them, at most `max`.
    pub fn drain_while(&self, max: usize, mut take: impl FnMut(&Data) -> bool) -> Vec<Data> {
        let mut queue = self.queue.lock();
        let mut taken = Vec::new();
        while taken.len() < max {
            match queue.front() {
                Some(front) if take(front) => {}
                _ => break,
            }
            if let Some(data) = queue.pop_front() {
                taken.push(data);
            }
        }
        taken
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Body, ChatBody};

    fn chat(text: &str) -> Data {
        Data::request(Body::Chat(ChatBody {
            client_id: "sender".to_string(),
            name: "Sender".to_string(),
            text: text.to_string(),
        }))
    }

    #[test]
    fn test_session_id() {
        let session = SessionComponent::new(Arc::new(CipherChain::identity()));
        assert_eq!(session.id(), None);
        session.set_id("abc");
        assert_eq!(session.id().as_deref(), Some("abc"));
        assert_eq!(session.nonce.next(), 0);
    }

    #[test]
    fn test_group_membership() {
        let group = GroupComponent::default();
        assert!(!group.is_member("g1"));
        group.set_id("g1");
        assert!(group.is_member("g1"));
        assert!(!group.is_member("g2"));
    }

    #[test]
    fn test_mute_toggle() {
        let mute = MuteComponent::default();
        mute.set("bob", true);
        assert!(mute.is_muted("bob"));
        mute.set("bob", false);
        assert!(!mute.is_muted("bob"));
        assert!(mute.is_empty());
    }

    #[test]
    fn test_mailbox_fifo_and_capacity() {
        let mailbox = MailboxComponent::with_capacity(2);
        assert!(mailbox.push(chat("one")));
        assert!(mailbox.push(chat("two")));
        assert!(!mailbox.push(chat("three")));

        let first = mailbox.drain(1);
        assert_eq!(first, vec![chat("one")]);
        assert_eq!(mailbox.drain(10), vec![chat("two")]);
        assert!(mailbox.is_empty());
    }

    #[test]
    fn test_mailbox_drain_while_stops_at_refusal() {
        let mailbox = MailboxComponent::default();
        for text in ["a", "bb", "c"] {
            mailbox.push(chat(text));
        }
        let taken = mailbox.drain_while(10, |data| match &data.body {
            Body::Chat(body) => body.text.len() == 1,
            _ => false,
        });
        assert_eq!(taken, vec![chat("a")]);
        assert_eq!(mailbox.len(), 2);
    }

    #[test]
    fn test_timer_component() {
        let timer = TimerComponent::default();
        assert!(timer.elapsed().is_some());
        timer.stop();
        assert!(!timer.expired(Duration::ZERO));
        timer.touch();
        assert!(timer.elapsed().is_some());
    }
}
