//! Message passing between the master rank and the worker ranks.
//!
//! Every rank owns one [`Mailbox`] and can reach every other rank through the
//! shared [`Fabric`]. Receives match on the sender and the kind of message;
//! anything else that arrives in the meantime is stashed for a later receive,
//! so messages from one sender are always seen in the order they were sent.
//!
//! The allocator drives workers through [`MasterLink`], workers coordinate with
//! their current group through [`Group`]. Neither side depends on the channels
//! underneath.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::error::{Result, SchedulerError};

/// Global rank number. The master is rank 0.
pub type Rank = usize;

/// Maps between global ranks and the 0-based worker numbering used by allocators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankLayout {
    workers: usize,
}

impl RankLayout {
    pub const MASTER: Rank = 0;

    pub fn new(workers: usize) -> Self {
        Self { workers }
    }

    /// Number of worker ranks.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Number of ranks including the master.
    pub fn total(&self) -> usize {
        self.workers + 1
    }

    pub fn master(&self) -> Rank {
        Self::MASTER
    }

    /// Global rank of worker `internal`.
    pub fn global(&self, internal: usize) -> Rank {
        debug_assert!(internal < self.workers, "worker {internal} out of range");
        internal + 1
    }

    /// Worker number of `global`, or `None` for the master and out-of-range ranks.
    pub fn internal(&self, global: Rank) -> Option<usize> {
        if global == Self::MASTER || global > self.workers {
            None
        } else {
            Some(global - 1)
        }
    }
}

/// Contiguous run of global ranks. Position `p` inside the run is rank `first + p`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankRange {
    pub first: Rank,
    pub size: usize,
}

impl RankRange {
    pub fn global(&self, position: usize) -> Rank {
        debug_assert!(position < self.size);
        self.first + position
    }

    /// The two halves produced by giving the first `first_size` positions to the first half.
    pub fn bisect(&self, first_size: usize) -> (RankRange, RankRange) {
        (
            RankRange {
                first: self.first,
                size: first_size,
            },
            RankRange {
                first: self.first + first_size,
                size: self.size - first_size,
            },
        )
    }
}

/// Work order relayed from the master to every rank of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTicket {
    pub job_id: String,
    /// Arguments with every template already filled in.
    pub argv: Vec<String>,
}

/// Control signal sent by the master to a group leader and relayed to its members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Bisect the group; the first `first_size` positions form the first child.
    Split { first_size: usize },
    Job(JobTicket),
    Terminate,
}

/// Sent by a group leader to the master once its job is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub exit_code: i32,
    /// Milliseconds between the start of the run and the start of the job.
    pub start_offset_ms: u64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Signal(Signal),
    Completion(Completion),
    /// A member finished its share of a job.
    Joined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Signal,
    Completion,
    Joined,
}

impl Message {
    pub fn tag(&self) -> Tag {
        match self {
            Message::Signal(_) => Tag::Signal,
            Message::Completion(_) => Tag::Completion,
            Message::Joined => Tag::Joined,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub source: Rank,
    pub message: Message,
}

/// Why a non-blocking send did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// The destination mailbox is full. Trying again later may succeed.
    Busy,
    /// The destination rank is gone.
    Closed,
}

impl LinkError {
    pub fn into_error(self, rank: Rank) -> SchedulerError {
        let reason = match self {
            LinkError::Busy => "mailbox is full",
            LinkError::Closed => "rank has exited",
        };
        SchedulerError::Transport {
            rank,
            reason: reason.to_string(),
        }
    }
}

/// Senders to every rank's mailbox.
#[derive(Clone)]
pub struct Fabric {
    senders: Arc<Vec<flume::Sender<Envelope>>>,
    capacity: usize,
}

impl Fabric {
    /// Creates the fabric and one mailbox per rank, indexed by global rank.
    ///
    /// Mailboxes never refuse a message. `capacity` is the backlog above which
    /// [`Fabric::try_send_bounded`] reports [`LinkError::Busy`].
    pub fn new(layout: RankLayout, capacity: usize) -> (Self, Vec<Mailbox>) {
        let mut senders = Vec::with_capacity(layout.total());
        let mut mailboxes = Vec::with_capacity(layout.total());
        for rank in 0..layout.total() {
            let (tx, rx) = flume::unbounded();
            senders.push(tx);
            mailboxes.push(Mailbox::new(rank, rx));
        }
        (
            Self {
                senders: Arc::new(senders),
                capacity,
            },
            mailboxes,
        )
    }

    fn sender(&self, dest: Rank) -> std::result::Result<&flume::Sender<Envelope>, LinkError> {
        self.senders.get(dest).ok_or(LinkError::Closed)
    }

    /// Sends without waiting. Only fails if `dest` is gone.
    pub fn try_send(
        &self,
        source: Rank,
        dest: Rank,
        message: Message,
    ) -> std::result::Result<(), LinkError> {
        trace!(source, dest, ?message, "try_send");
        self.sender(dest)?
            .try_send(Envelope { source, message })
            .map_err(|e| match e {
                flume::TrySendError::Full(_) => LinkError::Busy,
                flume::TrySendError::Disconnected(_) => LinkError::Closed,
            })
    }

    /// Sends without waiting, unless `dest` already has `capacity` messages queued.
    pub fn try_send_bounded(
        &self,
        source: Rank,
        dest: Rank,
        message: Message,
    ) -> std::result::Result<(), LinkError> {
        if self.sender(dest)?.len() >= self.capacity {
            return Err(LinkError::Busy);
        }
        self.try_send(source, dest, message)
    }

    /// Sends to `dest`, failing only if it is gone.
    pub async fn send(&self, source: Rank, dest: Rank, message: Message) -> Result<()> {
        trace!(source, dest, ?message, "send");
        self.sender(dest)
            .map_err(|e| e.into_error(dest))?
            .send_async(Envelope { source, message })
            .await
            .map_err(|_| LinkError::Closed.into_error(dest))
    }
}

pub struct Mailbox {
    rank: Rank,
    inbox: flume::Receiver<Envelope>,
    stash: VecDeque<Envelope>,
}

impl Mailbox {
    fn new(rank: Rank, inbox: flume::Receiver<Envelope>) -> Self {
        Self {
            rank,
            inbox,
            stash: VecDeque::new(),
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    fn take_stashed(&mut self, source: Rank, tag: Tag) -> Option<Message> {
        let index = self
            .stash
            .iter()
            .position(|e| e.source == source && e.message.tag() == tag)?;
        self.stash.remove(index).map(|e| e.message)
    }

    /// Waits for the next message of kind `tag` from `source`.
    pub async fn recv(&mut self, source: Rank, tag: Tag) -> Result<Message> {
        if let Some(message) = self.take_stashed(source, tag) {
            return Ok(message);
        }
        loop {
            let envelope = self
                .inbox
                .recv_async()
                .await
                .map_err(|_| SchedulerError::Transport {
                    rank: self.rank,
                    reason: format!("mailbox closed while waiting for rank {source}"),
                })?;
            if envelope.source == source && envelope.message.tag() == tag {
                return Ok(envelope.message);
            }
            self.stash.push_back(envelope);
        }
    }

    /// Returns the next message of kind `tag` from `source` if one has already arrived.
    pub fn try_recv(&mut self, source: Rank, tag: Tag) -> Result<Option<Message>> {
        loop {
            match self.inbox.try_recv() {
                Ok(envelope) => self.stash.push_back(envelope),
                Err(flume::TryRecvError::Empty) => break,
                Err(flume::TryRecvError::Disconnected) => {
                    if let Some(message) = self.take_stashed(source, tag) {
                        return Ok(Some(message));
                    }
                    return Err(SchedulerError::Transport {
                        rank: self.rank,
                        reason: "mailbox closed".to_string(),
                    });
                }
            }
        }
        Ok(self.take_stashed(source, tag))
    }
}

/// The master's view of the worker ranks.
pub trait MasterLink {
    /// Sends `signal` to the group led by `leader` without blocking.
    ///
    /// Job signals are refused with [`LinkError::Busy`] while the leader has a
    /// backlog; splits and terminations are always queued.
    fn send_signal(&mut self, leader: Rank, signal: Signal) -> std::result::Result<(), LinkError>;

    /// Returns the completion reported by `leader`, if it has arrived.
    fn poll_completion(&mut self, leader: Rank) -> Result<Option<Completion>>;
}

pub struct MasterEndpoint {
    fabric: Fabric,
    mailbox: Mailbox,
}

impl MasterEndpoint {
    pub fn new(fabric: Fabric, mailbox: Mailbox) -> Self {
        Self { fabric, mailbox }
    }
}

impl MasterLink for MasterEndpoint {
    fn send_signal(&mut self, leader: Rank, signal: Signal) -> std::result::Result<(), LinkError> {
        let source = self.mailbox.rank();
        match signal {
            Signal::Job(_) => self
                .fabric
                .try_send_bounded(source, leader, Message::Signal(signal)),
            _ => self.fabric.try_send(source, leader, Message::Signal(signal)),
        }
    }

    fn poll_completion(&mut self, leader: Rank) -> Result<Option<Completion>> {
        match self.mailbox.try_recv(leader, Tag::Completion)? {
            Some(Message::Completion(completion)) => Ok(Some(completion)),
            Some(other) => Err(SchedulerError::Protocol {
                rank: leader,
                reason: format!("expected a completion, got {other:?}"),
            }),
            None => Ok(None),
        }
    }
}

/// A rank's handle on the group of ranks it currently works with.
///
/// Position 0 is the leader: it alone takes signals from the master and
/// reports completions, and relays every signal to the other members.
#[async_trait]
pub trait Group: Send + Sized {
    fn global_rank(&self) -> Rank;
    fn position(&self) -> usize;
    fn size(&self) -> usize;
    fn leader(&self) -> Rank;

    fn is_leader(&self) -> bool {
        self.position() == 0
    }

    /// Leader only: waits for the next signal from the master.
    async fn next_master_signal(&mut self) -> Result<Signal>;

    /// Collective: the leader passes `Some(signal)`, members pass `None`, and
    /// everybody gets the leader's signal back.
    async fn broadcast(&mut self, signal: Option<Signal>) -> Result<Signal>;

    /// Collective, after the split size was broadcast: returns the child group
    /// this rank belongs to.
    fn split(self, first_size: usize) -> Result<Self>;

    /// Collective: returns on the leader once every member has called it.
    async fn join(&mut self) -> Result<()>;

    /// Leader only: tells the master the group's job is over.
    async fn report(&mut self, completion: Completion) -> Result<()>;
}

/// [`Group`] over the in-process fabric.
pub struct WorkerGroup {
    master: Rank,
    members: RankRange,
    position: usize,
    fabric: Fabric,
    mailbox: Mailbox,
}

impl WorkerGroup {
    /// A group made of `members`, seen from the rank owning `mailbox`.
    pub fn new(master: Rank, members: RankRange, fabric: Fabric, mailbox: Mailbox) -> Result<Self> {
        let rank = mailbox.rank();
        if rank < members.first || rank >= members.first + members.size {
            return Err(SchedulerError::Protocol {
                rank,
                reason: format!("rank is not part of group {members:?}"),
            });
        }
        Ok(Self {
            master,
            members,
            position: rank - members.first,
            fabric,
            mailbox,
        })
    }

    fn protocol_error(&self, reason: String) -> SchedulerError {
        SchedulerError::Protocol {
            rank: self.global_rank(),
            reason,
        }
    }
}

#[async_trait]
impl Group for WorkerGroup {
    fn global_rank(&self) -> Rank {
        self.mailbox.rank()
    }

    fn position(&self) -> usize {
        self.position
    }

    fn size(&self) -> usize {
        self.members.size
    }

    fn leader(&self) -> Rank {
        self.members.first
    }

    async fn next_master_signal(&mut self) -> Result<Signal> {
        if !self.is_leader() {
            return Err(self.protocol_error("only a leader listens to the master".to_string()));
        }
        let master = self.master;
        match self.mailbox.recv(master, Tag::Signal).await? {
            Message::Signal(signal) => Ok(signal),
            other => Err(self.protocol_error(format!("expected a signal, got {other:?}"))),
        }
    }

    async fn broadcast(&mut self, signal: Option<Signal>) -> Result<Signal> {
        match (self.is_leader(), signal) {
            (true, Some(signal)) => {
                let me = self.global_rank();
                for position in 1..self.members.size {
                    self.fabric
                        .send(me, self.members.global(position), Message::Signal(signal.clone()))
                        .await?;
                }
                Ok(signal)
            }
            (false, None) => {
                let leader = self.leader();
                match self.mailbox.recv(leader, Tag::Signal).await? {
                    Message::Signal(signal) => Ok(signal),
                    other => Err(self.protocol_error(format!("expected a signal, got {other:?}"))),
                }
            }
            (true, None) => Err(self.protocol_error("leader has nothing to broadcast".to_string())),
            (false, Some(_)) => {
                Err(self.protocol_error("only the leader can broadcast".to_string()))
            }
        }
    }

    fn split(self, first_size: usize) -> Result<Self> {
        if first_size == 0 || first_size >= self.members.size {
            return Err(self.protocol_error(format!(
                "cannot split a group of {} ranks at {first_size}",
                self.members.size
            )));
        }
        let (first, second) = self.members.bisect(first_size);
        let (members, position) = if self.position < first_size {
            (first, self.position)
        } else {
            (second, self.position - first_size)
        };
        Ok(Self {
            members,
            position,
            ..self
        })
    }

    async fn join(&mut self) -> Result<()> {
        if self.is_leader() {
            let members = self.members;
            for position in 1..members.size {
                self.mailbox.recv(members.global(position), Tag::Joined).await?;
            }
            Ok(())
        } else {
            let (me, leader) = (self.global_rank(), self.leader());
            self.fabric.send(me, leader, Message::Joined).await
        }
    }

    async fn report(&mut self, completion: Completion) -> Result<()> {
        if !self.is_leader() {
            return Err(self.protocol_error("only a leader reports completions".to_string()));
        }
        let me = self.global_rank();
        self.fabric
            .send(me, self.master, Message::Completion(completion))
            .await
    }
}
