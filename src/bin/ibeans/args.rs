use std::net::{IpAddr, Ipv4Addr};

use clap::Parser;
use ironbeans::server;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)))]
    pub(crate) listen: IpAddr,
    /// (TCP) port to listen on.
    #[arg(short, long, default_value_t = server::DEFAULT_PORT)]
    pub(crate) port: u16,
    /// Detaches from the controlling terminal and runs in the background.
    #[arg(short, long, default_value_t)]
    pub(crate) detach: bool,
    /// Sets the maximum allowed job size.
    #[arg(short = 'z', long, default_value_t = server::DEFAULT_MAX_JOB_SIZE)]
    pub(crate) max_job_size: u32,
    /// Sets the capacity of each of the ready and delay queues.
    #[arg(long, default_value_t = server::DEFAULT_HEAP_SIZE)]
    pub(crate) heap_size: usize,
    /// Enables human-friendly logging.
    #[arg(long, default_value_t)]
    pub(crate) debug: bool,
}
