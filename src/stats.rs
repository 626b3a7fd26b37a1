//! Statistics reporting for the `stats` and `stats <id>` commands.
//!
//! Both reports render as a YAML block used as the body of an `OK` reply.

use bytes::Bytes;
use serde::Serialize;
use tokio::time::Instant;

use crate::types::job::Job;
use crate::types::states::JobState;

/// Server-wide statistics.
#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerStats {
    pub current_jobs_urgent: u64,
    pub current_jobs_ready: u64,
    pub current_jobs_reserved: u64,
    pub current_jobs_delayed: u64,
    pub current_jobs_buried: u64,
    pub cmd_put: u64,
    pub cmd_peek: u64,
    pub cmd_reserve: u64,
    pub cmd_delete: u64,
    pub cmd_release: u64,
    pub cmd_bury: u64,
    pub cmd_kick: u64,
    pub cmd_stats: u64,
    pub job_timeouts: u64,
    pub total_jobs: u64,
    pub max_job_size: u32,
    pub heap_size: usize,
    pub current_connections: u64,
    pub current_producers: u64,
    pub current_workers: u64,
    pub current_waiting: u64,
    pub pid: u32,
    pub version: &'static str,
    pub rusage_utime: f64,
    pub rusage_stime: f64,
    pub uptime: u64,
}

/// Per-job statistics for `stats <id>`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobStats {
    pub id: u64,
    pub state: JobState,
    pub age: u64,
    pub delay: u32,
    pub ttr: u32,
    pub time_left: u64,
    pub timeouts: u64,
    pub releases: u64,
    pub buries: u64,
    pub kicks: u64,
}

impl JobStats {
    pub fn capture(j: &Job, now: Instant) -> Self {
        let time_left = match j.state {
            JobState::Delayed | JobState::Reserved => {
                j.deadline.saturating_duration_since(now).as_secs()
            },
            _ => 0,
        };

        Self {
            id: j.id,
            state: j.state,
            age: now.saturating_duration_since(j.creation).as_secs(),
            delay: j.delay,
            ttr: j.ttr,
            time_left,
            timeouts: j.timeout_ct,
            releases: j.release_ct,
            buries: j.bury_ct,
            kicks: j.kick_ct,
        }
    }
}

/// Renders a stats report as a YAML document, without wire framing. The
/// returned length is what `OK <bytes>` advertises.
pub fn render<T: Serialize>(stats: &T) -> Result<Bytes, serde_yaml::Error> {
    let yaml = serde_yaml::to_string(stats)?;

    let mut body = String::with_capacity(yaml.len() + 4);
    body.push_str("---\n");
    body.push_str(&yaml);

    Ok(Bytes::from(body))
}

/// User and system CPU time consumed so far, in seconds.
pub fn rusage_times() -> (f64, f64) {
    let mut usage = unsafe { std::mem::zeroed::<libc::rusage>() };
    let r = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if r != 0 {
        return (0.0, 0.0);
    }

    fn seconds(tv: libc::timeval) -> f64 {
        tv.tv_sec as f64 + tv.tv_usec as f64 / 1e6
    }

    (seconds(usage.ru_utime), seconds(usage.ru_stime))
}
