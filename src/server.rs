//! The job lifecycle engine: queues, reservation state machine, matching,
//! and the deadline timer.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conn;
use crate::heap::JobHeap;
use crate::stats::{self, JobStats, ServerStats};
use crate::types::job::{delay_cmp, pri_cmp, Job};
use crate::types::protocol::{Reply, ServerError};
use crate::types::states::JobState;

pub const DEFAULT_PORT: u16 = 11300;
pub const DEFAULT_MAX_JOB_SIZE: u32 = 65535;
pub const DEFAULT_HEAP_SIZE: usize = 1 << 24;

/// Server tuning knobs.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum job body size in bytes.
    pub max_job_size: u32,
    /// Capacity of each of the ready and delay queues.
    pub heap_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_job_size: DEFAULT_MAX_JOB_SIZE,
            heap_size: DEFAULT_HEAP_SIZE,
        }
    }
}

pub type ConnId = u64;

/// A reservation handed to a blocked worker through its oneshot.
#[derive(Debug)]
pub struct Handoff {
    pub id: u64,
    pub pri: u32,
    pub body: Bytes,
}

/// A worker blocked in `reserve`, queued FIFO.
struct Waiter {
    conn: ConnId,
    tx: oneshot::Sender<Handoff>,
}

#[derive(Default)]
struct ConnState {
    /// Reserved jobs, sorted by deadline ascending; element 0 is the
    /// soonest-expiring reservation.
    reserved: Vec<Job>,
    producer: bool,
    worker: bool,
}

#[derive(Default)]
struct CmdCounts {
    put: u64,
    peek: u64,
    reserve: u64,
    delete: u64,
    release: u64,
    bury: u64,
    kick: u64,
    stats: u64,
}

/// All queue state. Exactly one of these exists per server, behind the
/// shared mutex; every state transition happens with the lock held and no
/// handler awaits while holding it.
struct Core {
    ready: JobHeap,
    delayed: JobHeap,
    buried: VecDeque<Job>,
    conns: HashMap<ConnId, ConnState>,
    waiting: VecDeque<Waiter>,
    next_id: u64,
    next_conn: ConnId,
    urgent_ct: u64,
    timeout_ct: u64,
    cmds: CmdCounts,
    drain: bool,
    started: Instant,
    cfg: Config,
}

impl Core {
    fn new(cfg: Config) -> Self {
        Self {
            ready: JobHeap::new(cfg.heap_size, pri_cmp),
            delayed: JobHeap::new(cfg.heap_size, delay_cmp),
            buried: VecDeque::new(),
            conns: HashMap::new(),
            waiting: VecDeque::new(),
            next_id: 1,
            next_conn: 1,
            urgent_ct: 0,
            timeout_ct: 0,
            cmds: CmdCounts::default(),
            drain: false,
            started: Instant::now(),
            cfg,
        }
    }

    fn conn_mut(&mut self, conn: ConnId) -> &mut ConnState {
        self.conns.entry(conn).or_default()
    }

    /// Moves a job into the ready queue, falling back to the graveyard when
    /// the heap is full. Returns the state the job ended up in.
    fn enqueue_ready(&mut self, mut j: Job) -> JobState {
        j.state = JobState::Ready;
        let urgent = j.is_urgent();

        match self.ready.give(j) {
            Ok(()) => {
                if urgent {
                    self.urgent_ct += 1;
                }
                JobState::Ready
            },
            Err(j) => self.bury_job(j),
        }
    }

    /// Moves a job into the delay queue with `deadline = now + delay`,
    /// falling back to the graveyard when the heap is full.
    fn enqueue_delayed(&mut self, mut j: Job, now: Instant) -> JobState {
        j.state = JobState::Delayed;
        j.deadline = now + Duration::from_secs(u64::from(j.delay));

        match self.delayed.give(j) {
            Ok(()) => JobState::Delayed,
            Err(j) => self.bury_job(j),
        }
    }

    /// Appends a job to the graveyard. The graveyard is unbounded, which is
    /// what makes it a safe last resort for every overflow path.
    fn bury_job(&mut self, mut j: Job) -> JobState {
        j.state = JobState::Buried;
        self.buried.push_back(j);
        JobState::Buried
    }

    /// Removes the minimum ready job, maintaining the urgent count.
    fn take_ready(&mut self) -> Option<Job> {
        let j = self.ready.take()?;
        if j.is_urgent() {
            self.urgent_ct -= 1;
        }
        Some(j)
    }

    /// The matching step: pairs ready jobs with waiting workers until one
    /// side runs out.
    fn process_queue(&mut self, now: Instant) {
        while !self.waiting.is_empty() {
            let Some(job) = self.take_ready() else { return };
            self.offer(job, now);
        }
    }

    /// Hands a ready job to the head waiter. Waiters whose worker task has
    /// gone away are discarded and the job offered to the next; if every
    /// waiter is gone the job returns to the ready queue.
    fn offer(&mut self, mut job: Job, now: Instant) {
        while let Some(w) = self.waiting.pop_front() {
            job.state = JobState::Reserved;
            job.deadline = now + Duration::from_secs(u64::from(job.ttr));

            let handoff = Handoff {
                id: job.id,
                pri: job.pri,
                body: job.body.clone(),
            };

            if w.tx.send(handoff).is_ok() {
                // The worker task is alive and will write RESERVED; if it
                // dies before deleting, disconnect requeues the job.
                self.reserve_for(w.conn, job);
                return;
            }
        }

        self.enqueue_ready(job);
    }

    /// Records a reservation in the owning connection's set, keeping it
    /// sorted by deadline.
    fn reserve_for(&mut self, conn: ConnId, job: Job) {
        let cs = self.conn_mut(conn);
        let at = cs.reserved.partition_point(|r| r.deadline <= job.deadline);
        cs.reserved.insert(at, job);
    }

    fn remove_reserved(&mut self, conn: ConnId, id: u64) -> Option<Job> {
        let cs = self.conns.get_mut(&conn)?;
        let at = cs.reserved.iter().position(|j| j.id == id)?;
        Some(cs.reserved.remove(at))
    }

    fn remove_buried(&mut self, id: u64) -> Option<Job> {
        let at = self.buried.iter().position(|j| j.id == id)?;
        self.buried.remove(at)
    }

    fn remove_any_reserved(&mut self, id: u64) -> Option<Job> {
        let conn = self.conns.iter().find_map(|(cid, cs)| {
            cs.reserved.iter().any(|j| j.id == id).then_some(*cid)
        })?;
        self.remove_reserved(conn, id)
    }

    /// Finds a job in any pool, for `peek <id>` and `stats <id>`.
    fn find_job(&self, id: u64) -> Option<&Job> {
        self.ready
            .find(id)
            .or_else(|| self.delayed.find(id))
            .or_else(|| self.buried.iter().find(|j| j.id == id))
            .or_else(|| {
                self.conns
                    .values()
                    .flat_map(|cs| cs.reserved.iter())
                    .find(|j| j.id == id)
            })
    }

    /// Moves up to `bound` jobs back to the ready queue: graveyard first
    /// (FIFO), else the earliest-deadline delayed jobs. Returns how many
    /// landed in ready.
    fn kick_jobs(&mut self, bound: u64) -> u64 {
        let mut moved = 0;

        if !self.buried.is_empty() {
            let takes = (self.buried.len() as u64).min(bound);
            for _ in 0..takes {
                let Some(job) = self.buried.pop_front() else { break };
                // Skip jobs that no longer fit; they go back to the
                // graveyard tail.
                if self.kick_to_ready(job) {
                    moved += 1;
                }
            }
        } else {
            while moved < bound {
                let Some(job) = self.delayed.take() else { break };
                if !self.kick_to_ready(job) {
                    // The ready queue is full; it stays full for the rest of
                    // this kick.
                    break;
                }
                moved += 1;
            }
        }

        moved
    }

    /// Returns true if the job landed in ready; a full heap buries it
    /// instead, without counting it as kicked.
    fn kick_to_ready(&mut self, mut job: Job) -> bool {
        if self.ready.is_full() {
            self.bury_job(job);
            return false;
        }

        job.kick_ct += 1;
        self.enqueue_ready(job);
        true
    }

    /// Promotes expired delayed jobs and expires overdue reservations.
    fn expire(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|j| j.deadline <= now) {
            if let Some(job) = self.delayed.take() {
                self.enqueue_ready(job);
                self.process_queue(now);
            }
        }

        let conn_ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for cid in conn_ids {
            while let Some(mut job) = self.pop_expired_reservation(cid, now) {
                debug!(id = job.id, conn = cid, "reservation timed out");
                job.timeout_ct += 1;
                self.timeout_ct += 1;
                self.enqueue_ready(job);
            }
        }

        self.process_queue(now);
    }

    fn pop_expired_reservation(
        &mut self,
        conn: ConnId,
        now: Instant,
    ) -> Option<Job> {
        let cs = self.conns.get_mut(&conn)?;
        if cs.reserved.first().is_some_and(|j| j.deadline <= now) {
            Some(cs.reserved.remove(0))
        } else {
            None
        }
    }

    /// The next instant at which the timer must fire: the soonest delayed
    /// promotion or reservation expiry.
    fn next_deadline(&self) -> Option<Instant> {
        let delay = self.delayed.peek().map(|j| j.deadline);
        let ttr = self
            .conns
            .values()
            .filter_map(|cs| cs.reserved.first())
            .map(|j| j.deadline)
            .min();

        match (delay, ttr) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn server_stats(&self, now: Instant) -> ServerStats {
        let (rusage_utime, rusage_stime) = stats::rusage_times();

        ServerStats {
            current_jobs_urgent: self.urgent_ct,
            current_jobs_ready: self.ready.used() as u64,
            current_jobs_reserved: self
                .conns
                .values()
                .map(|cs| cs.reserved.len() as u64)
                .sum(),
            current_jobs_delayed: self.delayed.used() as u64,
            current_jobs_buried: self.buried.len() as u64,
            cmd_put: self.cmds.put,
            cmd_peek: self.cmds.peek,
            cmd_reserve: self.cmds.reserve,
            cmd_delete: self.cmds.delete,
            cmd_release: self.cmds.release,
            cmd_bury: self.cmds.bury,
            cmd_kick: self.cmds.kick,
            cmd_stats: self.cmds.stats,
            job_timeouts: self.timeout_ct,
            total_jobs: self.next_id - 1,
            max_job_size: self.cfg.max_job_size,
            heap_size: self.cfg.heap_size,
            current_connections: self.conns.len() as u64,
            current_producers: self
                .conns
                .values()
                .filter(|cs| cs.producer)
                .count() as u64,
            current_workers: self
                .conns
                .values()
                .filter(|cs| cs.worker)
                .count() as u64,
            current_waiting: self.waiting.len() as u64,
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION"),
            rusage_utime,
            rusage_stime,
            uptime: now.saturating_duration_since(self.started).as_secs(),
        }
    }
}

struct Shared {
    core: Mutex<Core>,
    /// Re-arms the timer task whenever a handler creates a new deadline.
    timer: Notify,
    cfg: Config,
}

/// Shared server handle. Cloning is cheap; every clone drives the same
/// core.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    pub fn new(cfg: Config) -> Self {
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(Core::new(cfg.clone())),
                timer: Notify::new(),
                cfg,
            }),
        }
    }

    pub fn max_job_size(&self) -> u32 {
        self.shared.cfg.max_job_size
    }

    fn rearm_timer(&self) {
        self.shared.timer.notify_one();
    }

    /// Registers a new client connection and returns its id.
    pub async fn register_conn(&self) -> ConnId {
        let mut core = self.shared.core.lock().await;
        let id = core.next_conn;
        core.next_conn += 1;
        core.conns.insert(id, ConnState::default());
        id
    }

    /// Releases everything the connection holds: its waiter leaves the
    /// waiting queue and reserved jobs go back to the ready queue
    /// (graveyard on overflow).
    pub async fn disconnect(&self, conn: ConnId) {
        let mut core = self.shared.core.lock().await;

        core.waiting.retain(|w| w.conn != conn);

        let Some(cs) = core.conns.remove(&conn) else { return };

        let now = Instant::now();
        for job in cs.reserved {
            core.enqueue_ready(job);
        }
        core.process_queue(now);
        drop(core);

        self.rearm_timer();
    }

    /// `put <pri> <delay> <ttr> <bytes>`: create a job. The body arrives
    /// already stripped of its CRLF trailer.
    pub async fn put(
        &self,
        conn: ConnId,
        pri: u32,
        delay: u32,
        ttr: u32,
        body: Bytes,
    ) -> Reply {
        let mut core = self.shared.core.lock().await;
        core.cmds.put += 1;
        core.conn_mut(conn).producer = true;

        if core.drain {
            return Reply::ServerError(ServerError::Draining);
        }

        let now = Instant::now();
        let id = core.next_id;
        core.next_id += 1;

        let job = Job::new(id, pri, delay, ttr, body, now);
        let state = if delay > 0 {
            core.enqueue_delayed(job, now)
        } else {
            let state = core.enqueue_ready(job);
            core.process_queue(now);
            state
        };
        drop(core);

        self.rearm_timer();

        match state {
            JobState::Buried => Reply::BuriedId { id },
            _ => Reply::Inserted { id },
        }
    }

    /// `reserve`: queue the calling worker for a job.
    ///
    /// The returned receiver resolves when the matching step hands this
    /// worker a job; dropping it abandons the wait. A connection may hold
    /// several reservations by calling this repeatedly.
    pub async fn reserve(&self, conn: ConnId) -> oneshot::Receiver<Handoff> {
        let (tx, rx) = oneshot::channel();

        let mut core = self.shared.core.lock().await;
        core.cmds.reserve += 1;
        core.conn_mut(conn).worker = true;
        core.waiting.push_back(Waiter { conn, tx });
        core.process_queue(Instant::now());
        drop(core);

        self.rearm_timer();

        rx
    }

    /// `delete <id>`: destroy a job. Resolution order: reserved by this
    /// connection, buried, then reserved by anyone (administrative
    /// deletion). Ready and delayed jobs are not deletable.
    pub async fn delete(&self, conn: ConnId, id: u64) -> Reply {
        let mut core = self.shared.core.lock().await;
        core.cmds.delete += 1;

        let destroyed = core
            .remove_reserved(conn, id)
            .or_else(|| core.remove_buried(id))
            .or_else(|| core.remove_any_reserved(id));

        match destroyed {
            Some(_) => Reply::Deleted,
            None => Reply::NotFound,
        }
    }

    /// `release <id> <pri> <delay>`: return a job reserved by this
    /// connection to the ready (or delay) queue.
    pub async fn release(
        &self,
        conn: ConnId,
        id: u64,
        pri: u32,
        delay: u32,
    ) -> Reply {
        let mut core = self.shared.core.lock().await;
        core.cmds.release += 1;

        let Some(mut job) = core.remove_reserved(conn, id) else {
            return Reply::NotFound;
        };

        job.pri = pri;
        job.delay = delay;
        job.release_ct += 1;

        let now = Instant::now();
        let state = if delay > 0 {
            core.enqueue_delayed(job, now)
        } else {
            let state = core.enqueue_ready(job);
            core.process_queue(now);
            state
        };
        drop(core);

        self.rearm_timer();

        match state {
            JobState::Buried => Reply::Buried,
            _ => Reply::Released,
        }
    }

    /// `bury <id> <pri>`: move a job reserved by this connection to the
    /// graveyard tail.
    pub async fn bury(&self, conn: ConnId, id: u64, pri: u32) -> Reply {
        let mut core = self.shared.core.lock().await;
        core.cmds.bury += 1;

        let Some(mut job) = core.remove_reserved(conn, id) else {
            return Reply::NotFound;
        };

        job.pri = pri;
        job.bury_ct += 1;
        core.bury_job(job);

        Reply::Buried
    }

    /// `kick <bound>`: promote buried jobs (or, when the graveyard is
    /// empty, the soonest delayed jobs) back to ready.
    pub async fn kick(&self, bound: u64) -> Reply {
        let mut core = self.shared.core.lock().await;
        core.cmds.kick += 1;

        let now = Instant::now();
        let count = core.kick_jobs(bound);
        if count > 0 {
            core.process_queue(now);
        }
        drop(core);

        self.rearm_timer();

        Reply::Kicked { count }
    }

    /// `peek`: the buried head if any, else the next-to-fire delayed job.
    pub async fn peek(&self) -> Reply {
        let mut core = self.shared.core.lock().await;
        core.cmds.peek += 1;

        match core.buried.front().or_else(|| core.delayed.peek()) {
            Some(j) => Reply::Found {
                id: j.id,
                pri: j.pri,
                body: j.body.clone(),
            },
            None => Reply::NotFound,
        }
    }

    /// `peek <id>`: find a job in any pool.
    pub async fn peek_job(&self, id: u64) -> Reply {
        let mut core = self.shared.core.lock().await;
        core.cmds.peek += 1;

        match core.find_job(id) {
            Some(j) => Reply::Found {
                id: j.id,
                pri: j.pri,
                body: j.body.clone(),
            },
            None => Reply::NotFound,
        }
    }

    /// `stats`: the server-wide report.
    pub async fn stats(&self) -> Reply {
        let mut core = self.shared.core.lock().await;
        core.cmds.stats += 1;
        let report = core.server_stats(Instant::now());
        drop(core);

        self.render_stats(&report)
    }

    /// `stats <id>`: the per-job report.
    pub async fn stats_job(&self, id: u64) -> Reply {
        let mut core = self.shared.core.lock().await;
        core.cmds.stats += 1;

        let now = Instant::now();
        let Some(report) = core.find_job(id).map(|j| JobStats::capture(j, now))
        else {
            return Reply::NotFound;
        };
        drop(core);

        self.render_stats(&report)
    }

    fn render_stats<T: serde::Serialize>(&self, report: &T) -> Reply {
        match stats::render(report) {
            Ok(body) => Reply::Ok { body },
            Err(error) => {
                warn!(%error, "failed to render stats report");
                Reply::ServerError(ServerError::Internal)
            },
        }
    }

    /// Enters drain mode: all subsequent puts are refused so the queues can
    /// empty out. Irreversible for the life of the process.
    pub async fn drain(&self) {
        let mut core = self.shared.core.lock().await;
        if !core.drain {
            info!("entering drain mode");
            core.drain = true;
        }
    }

    /// Drives delay expiry and TTR expiry. Exactly one instance of this
    /// runs per server; it sleeps until the earliest deadline and is
    /// re-armed by handlers that create new deadlines.
    pub async fn run_timer(self, cancel: CancellationToken) {
        loop {
            let next = {
                let mut core = self.shared.core.lock().await;
                core.expire(Instant::now());
                core.next_deadline()
            };

            select! {
                _ = cancel.cancelled() => return,
                _ = self.shared.timer.notified() => {},
                _ = deadline_sleep(next) => {},
            }
        }
    }

    /// Accepts connections until cancelled, handling each as its own task.
    pub async fn serve(
        self,
        listener: TcpListener,
        cancel: CancellationToken,
        shutdown_hold: mpsc::Sender<()>,
    ) -> Result<()> {
        info!(addr = %listener.local_addr()?, "listening");

        loop {
            let conn = match select! {
                accept = listener.accept() => accept,
                _ = cancel.cancelled() => break,
            } {
                Ok((conn, _)) => conn,
                Err(error) => {
                    warn!(%error, "failed to accept connection");
                    continue;
                },
            };

            tokio::spawn(conn::handle(
                self.clone(),
                cancel.clone(),
                shutdown_hold.clone(),
                conn,
            ));
        }

        Ok(())
    }
}

async fn deadline_sleep(next: Option<Instant>) {
    match next {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(text: &str) -> Bytes {
        Bytes::copy_from_slice(text.as_bytes())
    }

    fn small_server() -> Server {
        Server::new(Config {
            max_job_size: 65535,
            heap_size: 4,
        })
    }

    /// Runs the expiry pass directly, standing in for a timer fire.
    async fn tick(server: &Server) {
        let mut core = server.shared.core.lock().await;
        core.expire(Instant::now());
    }

    #[tokio::test(start_paused = true)]
    async fn put_then_reserve_round_trips() {
        let server = small_server();
        let producer = server.register_conn().await;
        let worker = server.register_conn().await;

        let reply = server.put(producer, 0, 0, 60, body("hello")).await;
        assert_eq!(reply, Reply::Inserted { id: 1 });

        let handoff = server.reserve(worker).await.await.unwrap();
        assert_eq!(handoff.id, 1);
        assert_eq!(handoff.pri, 0);
        assert_eq!(handoff.body, body("hello"));

        assert_eq!(server.delete(worker, 1).await, Reply::Deleted);
        assert_eq!(server.delete(worker, 1).await, Reply::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn equal_priority_jobs_are_fifo_and_lower_pri_wins() {
        let server = small_server();
        let producer = server.register_conn().await;
        let worker = server.register_conn().await;

        server.put(producer, 10, 0, 60, body("a")).await;
        server.put(producer, 1, 0, 60, body("b")).await;
        server.put(producer, 10, 0, 60, body("c")).await;

        let mut got = Vec::new();
        for _ in 0..3 {
            let handoff = server.reserve(worker).await.await.unwrap();
            got.push(handoff.body);
            server.delete(worker, handoff.id).await;
        }

        assert_eq!(got, vec![body("b"), body("a"), body("c")]);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_workers_are_served_fifo() {
        let server = small_server();
        let producer = server.register_conn().await;
        let w1 = server.register_conn().await;
        let w2 = server.register_conn().await;

        let mut rx1 = server.reserve(w1).await;
        let mut rx2 = server.reserve(w2).await;
        assert!(rx1.try_recv().is_err());

        server.put(producer, 0, 0, 60, body("first")).await;
        server.put(producer, 0, 0, 60, body("second")).await;

        assert_eq!(rx1.try_recv().unwrap().id, 1);
        assert_eq!(rx2.try_recv().unwrap().id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_jobs_promote_at_their_deadline() {
        let server = small_server();
        let producer = server.register_conn().await;
        let worker = server.register_conn().await;

        server.put(producer, 0, 3, 60, body("later")).await;

        let mut rx = server.reserve(worker).await;
        tick(&server).await;
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(4)).await;
        tick(&server).await;

        assert_eq!(rx.try_recv().unwrap().id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ttr_expiry_requeues_with_timeout_counted() {
        let server = small_server();
        let producer = server.register_conn().await;
        let w1 = server.register_conn().await;
        let w2 = server.register_conn().await;

        server.put(producer, 0, 0, 1, body("y")).await;
        let handoff = server.reserve(w1).await.await.unwrap();
        assert_eq!(handoff.id, 1);

        // w1 sits on the job past its TTR.
        tokio::time::advance(Duration::from_secs(2)).await;
        tick(&server).await;

        let again = server.reserve(w2).await.await.unwrap();
        assert_eq!(again.id, 1);

        // w1 no longer owns it.
        assert_eq!(server.release(w1, 1, 0, 0).await, Reply::NotFound);

        let reply = server.stats_job(1).await;
        let Reply::Ok { body } = reply else {
            panic!("expected OK reply, got {reply:?}")
        };
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.contains("timeouts: 1\n"), "{text}");
        assert!(text.contains("state: reserved\n"), "{text}");
    }

    #[tokio::test(start_paused = true)]
    async fn release_requeues_and_delayed_release_waits() {
        let server = small_server();
        let producer = server.register_conn().await;
        let worker = server.register_conn().await;

        server.put(producer, 5, 0, 60, body("z")).await;
        let handoff = server.reserve(worker).await.await.unwrap();

        // Releasing with the same pri and no delay leaves the job ready
        // again, observably unchanged.
        let reply = server.release(worker, handoff.id, 5, 0).await;
        assert_eq!(reply, Reply::Released);

        let again = server.reserve(worker).await.await.unwrap();
        assert_eq!(again.id, 1);
        assert_eq!(again.pri, 5);
        assert_eq!(again.body, body("z"));

        // A delayed release goes through the delay queue.
        assert_eq!(server.release(worker, 1, 5, 3).await, Reply::Released);
        let mut rx = server.reserve(worker).await;
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(4)).await;
        tick(&server).await;
        assert_eq!(rx.try_recv().unwrap().id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bury_peek_kick_cycle() {
        let server = small_server();
        let producer = server.register_conn().await;
        let worker = server.register_conn().await;

        server.put(producer, 0, 0, 60, body("y")).await;
        let handoff = server.reserve(worker).await.await.unwrap();

        assert_eq!(server.bury(worker, handoff.id, 5).await, Reply::Buried);

        // peek prefers the buried job and reports its new priority.
        let reply = server.peek().await;
        assert_eq!(
            reply,
            Reply::Found {
                id: 1,
                pri: 5,
                body: body("y")
            }
        );

        assert_eq!(server.kick(1).await, Reply::Kicked { count: 1 });

        let again = server.reserve(worker).await.await.unwrap();
        assert_eq!(again.id, 1);
        assert_eq!(again.body, body("y"));

        let reply = server.stats_job(1).await;
        let Reply::Ok { body } = reply else {
            panic!("expected OK reply, got {reply:?}")
        };
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.contains("buries: 1\n"), "{text}");
        assert!(text.contains("kicks: 1\n"), "{text}");
    }

    #[tokio::test(start_paused = true)]
    async fn peek_prefers_buried_over_delayed() {
        let server = small_server();
        let producer = server.register_conn().await;
        let worker = server.register_conn().await;

        server.put(producer, 0, 30, 60, body("delayed")).await;
        assert_eq!(
            server.peek().await,
            Reply::Found {
                id: 1,
                pri: 0,
                body: body("delayed")
            }
        );

        server.put(producer, 0, 0, 60, body("buried")).await;
        let handoff = server.reserve(worker).await.await.unwrap();
        server.bury(worker, handoff.id, 9).await;

        assert_eq!(
            server.peek().await,
            Reply::Found {
                id: 2,
                pri: 9,
                body: body("buried")
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn kick_from_delay_queue_takes_earliest_deadline() {
        let server = small_server();
        let producer = server.register_conn().await;
        let worker = server.register_conn().await;

        // Graveyard empty: kick must promote the next-to-fire delayed job,
        // not the oldest.
        server.put(producer, 0, 60, 30, body("late")).await;
        server.put(producer, 0, 5, 30, body("soon")).await;

        assert_eq!(server.kick(1).await, Reply::Kicked { count: 1 });

        let handoff = server.reserve(worker).await.await.unwrap();
        assert_eq!(handoff.id, 2);
        assert_eq!(handoff.body, body("soon"));
    }

    #[tokio::test(start_paused = true)]
    async fn kick_counts_only_actual_moves() {
        let server = small_server();
        let producer = server.register_conn().await;
        let worker = server.register_conn().await;

        server.put(producer, 0, 0, 60, body("a")).await;
        let handoff = server.reserve(worker).await.await.unwrap();
        server.bury(worker, handoff.id, 0).await;

        assert_eq!(server.kick(100).await, Reply::Kicked { count: 1 });
        assert_eq!(server.kick(100).await, Reply::Kicked { count: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn put_overflow_buries() {
        let server = small_server();
        let producer = server.register_conn().await;

        for id in 1..=4 {
            let reply = server.put(producer, 0, 0, 60, body("x")).await;
            assert_eq!(reply, Reply::Inserted { id });
        }

        // Heap capacity is 4; the fifth put is buried, not lost.
        let reply = server.put(producer, 0, 0, 60, body("x")).await;
        assert_eq!(reply, Reply::BuriedId { id: 5 });

        let reply = server.peek_job(5).await;
        assert_eq!(
            reply,
            Reply::Found {
                id: 5,
                pri: 0,
                body: body("x")
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delete_resolves_own_then_buried_then_any() {
        let server = small_server();
        let producer = server.register_conn().await;
        let w1 = server.register_conn().await;
        let w2 = server.register_conn().await;

        // Job reserved by w1 is deletable by w2 (administrative path).
        server.put(producer, 0, 0, 60, body("a")).await;
        let handoff = server.reserve(w1).await.await.unwrap();
        assert_eq!(server.delete(w2, handoff.id).await, Reply::Deleted);
        assert_eq!(server.release(w1, handoff.id, 0, 0).await, Reply::NotFound);

        // Buried jobs are deletable by anyone.
        server.put(producer, 0, 0, 60, body("b")).await;
        let handoff = server.reserve(w1).await.await.unwrap();
        server.bury(w1, handoff.id, 0).await;
        assert_eq!(server.delete(w2, handoff.id).await, Reply::Deleted);

        // Ready jobs are not deletable.
        server.put(producer, 0, 0, 60, body("c")).await;
        assert_eq!(server.delete(producer, 3).await, Reply::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_requeues_reservations() {
        let server = small_server();
        let producer = server.register_conn().await;
        let w1 = server.register_conn().await;
        let w2 = server.register_conn().await;

        server.put(producer, 0, 0, 60, body("held")).await;
        let handoff = server.reserve(w1).await.await.unwrap();
        assert_eq!(handoff.id, 1);

        server.disconnect(w1).await;

        // The job survived the close and is ready again.
        let again = server.reserve(w2).await.await.unwrap();
        assert_eq!(again.id, 1);
        assert_eq!(again.body, body("held"));
    }

    #[tokio::test(start_paused = true)]
    async fn dead_waiters_are_skipped() {
        let server = small_server();
        let producer = server.register_conn().await;
        let w1 = server.register_conn().await;
        let w2 = server.register_conn().await;

        let rx1 = server.reserve(w1).await;
        let mut rx2 = server.reserve(w2).await;

        // w1 goes away before any job shows up; its waiter is unlinked.
        drop(rx1);
        server.disconnect(w1).await;
        {
            let core = server.shared.core.lock().await;
            assert_eq!(core.waiting.len(), 1);
        }

        server.put(producer, 0, 0, 60, body("x")).await;
        assert_eq!(rx2.try_recv().unwrap().id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_refuses_puts_but_serves_the_rest() {
        let server = small_server();
        let producer = server.register_conn().await;
        let worker = server.register_conn().await;

        server.put(producer, 0, 0, 60, body("old")).await;
        server.drain().await;

        let reply = server.put(producer, 0, 0, 60, body("new")).await;
        assert_eq!(reply, Reply::ServerError(ServerError::Draining));

        // A rejected put consumes no id.
        let handoff = server.reserve(worker).await.await.unwrap();
        assert_eq!(handoff.id, 1);
        assert_eq!(server.delete(worker, 1).await, Reply::Deleted);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_track_counts_and_totals() {
        let server = small_server();
        let producer = server.register_conn().await;
        let worker = server.register_conn().await;

        server.put(producer, 3, 0, 60, body("urgent")).await;
        server.put(producer, 2000, 30, 60, body("later")).await;
        let _rx = server.reserve(worker).await;

        let reply = server.stats().await;
        let Reply::Ok { body } = reply else {
            panic!("expected OK reply, got {reply:?}")
        };
        let text = std::str::from_utf8(&body).unwrap();

        assert!(text.starts_with("---\n"), "{text}");
        assert!(text.contains("current-jobs-urgent: 0\n"), "{text}");
        assert!(text.contains("current-jobs-ready: 0\n"), "{text}");
        assert!(text.contains("current-jobs-reserved: 1\n"), "{text}");
        assert!(text.contains("current-jobs-delayed: 1\n"), "{text}");
        assert!(text.contains("cmd-put: 2\n"), "{text}");
        assert!(text.contains("cmd-reserve: 1\n"), "{text}");
        assert!(text.contains("total-jobs: 2\n"), "{text}");
        assert!(text.contains("current-connections: 2\n"), "{text}");
        assert!(text.contains("current-producers: 1\n"), "{text}");
        assert!(text.contains("current-workers: 1\n"), "{text}");
    }

    #[tokio::test(start_paused = true)]
    async fn job_accounting_balances() {
        let server = small_server();
        let producer = server.register_conn().await;
        let worker = server.register_conn().await;

        server.put(producer, 0, 0, 60, body("a")).await;
        server.put(producer, 0, 10, 60, body("b")).await;
        server.put(producer, 0, 0, 60, body("c")).await;
        let handoff = server.reserve(worker).await.await.unwrap();
        server.bury(worker, handoff.id, 0).await;
        server.put(producer, 0, 0, 60, body("d")).await;
        server.delete(worker, handoff.id).await;

        let core = server.shared.core.lock().await;
        let reserved: usize =
            core.conns.values().map(|cs| cs.reserved.len()).sum();
        let live = core.ready.used()
            + core.delayed.used()
            + core.buried.len()
            + reserved;

        // created minus deleted
        assert_eq!(live as u64, (core.next_id - 1) - 1);
    }
}
