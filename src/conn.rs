//! Per-connection protocol driver.

use std::ascii;
use std::collections::VecDeque;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::WriteHalf;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::line_reader::LineReader;
use crate::server::{ConnId, Server};
use crate::types::protocol::{ClientError, Command, Reply};
use crate::types::serialisable::BeanstalkSerialisable;

/// Handles one client connection to completion.
///
/// The shutdown-hold sender is kept for the life of the task so the process
/// can wait for in-flight connections before exiting.
#[instrument(name = "conn", err, fields(peer = %conn.peer_addr()?), skip_all)]
pub async fn handle(
    server: Server,
    cancel: CancellationToken,
    _shutdown_hold: mpsc::Sender<()>,
    mut conn: TcpStream,
) -> Result<()> {
    debug!("accepted connection");

    conn.set_nodelay(true).context("setting NODELAY")?;

    let id = server.register_conn().await;
    let ret = drive(&server, &cancel, id, &mut conn).await;
    server.disconnect(id).await;

    conn.shutdown().await.context("during shutdown")?;

    debug!("closed connection");

    ret
}

async fn drive(
    server: &Server,
    cancel: &CancellationToken,
    id: ConnId,
    conn: &mut TcpStream,
) -> Result<()> {
    let (read, mut write) = conn.split();
    let mut reader: LineReader<_> = read.into();

    // Lines that arrived while this connection was blocked in reserve; they
    // are served before the socket is read again.
    let mut pipelined: VecDeque<Bytes> = VecDeque::new();

    loop {
        let line = match pipelined.pop_front() {
            Some(line) => Some(line),
            None => select! {
                l = reader.read_line() => l.context("reading command")?,
                _ = cancel.cancelled() => return Ok(()),
            },
        };

        // The client hung up between commands.
        let Some(line) = line else { return Ok(()) };

        trace!(cmd = bytes_to_human_str(&line), "processing command");

        let cmd = match TryInto::<Command>::try_into(line.as_ref()) {
            Ok(cmd) => cmd,
            Err(e) => {
                // The parser cannot resynchronise after a bad line, so the
                // error reply is terminal.
                let resp =
                    Reply::ClientError(e.into()).serialise_beanstalk();
                write_reply(cancel, &mut write, &resp).await?;
                return Ok(());
            },
        };

        let reply = match cmd {
            Command::Put {
                pri,
                delay,
                ttr,
                n_bytes,
            } => {
                match read_put_body(server, &mut reader, n_bytes).await? {
                    BodyRead::Body(body) => {
                        server.put(id, pri, delay, ttr, body).await
                    },
                    BodyRead::Bad(e) => Reply::ClientError(e),
                    BodyRead::Eof => return Ok(()),
                }
            },
            Command::Reserve => {
                let mut rx = server.reserve(id).await;
                // Keep watching the socket while queued: a worker that
                // hangs up must give up its place in line rather than be
                // handed a job.
                let handoff = loop {
                    select! {
                        h = &mut rx => match h {
                            Ok(h) => break h,
                            // The server core went away; nothing left to do.
                            Err(_) => return Ok(()),
                        },
                        l = reader.read_line() => {
                            match l.context("reading while waiting")? {
                                // EOF while queued. Returning drops the
                                // receiver, so the matching step skips this
                                // waiter, and disconnect unlinks it.
                                None => return Ok(()),
                                // A pipelined command; serve it once the
                                // reservation resolves.
                                Some(line) => pipelined.push_back(line),
                            }
                        },
                        _ = cancel.cancelled() => return Ok(()),
                    }
                };
                Reply::Reserved {
                    id: handoff.id,
                    pri: handoff.pri,
                    body: handoff.body,
                }
            },
            Command::Delete { id: job } => server.delete(id, job).await,
            Command::Release {
                id: job,
                pri,
                delay,
            } => server.release(id, job, pri, delay).await,
            Command::Bury { id: job, pri } => server.bury(id, job, pri).await,
            Command::Kick { bound } => server.kick(bound).await,
            Command::Peek => server.peek().await,
            Command::PeekJob { id: job } => server.peek_job(job).await,
            Command::Stats => server.stats().await,
            Command::StatsJob { id: job } => server.stats_job(job).await,
        };

        let closing = reply.closes_connection();
        let resp = reply.serialise_beanstalk();
        write_reply(cancel, &mut write, &resp).await?;

        if closing {
            return Ok(());
        }
    }
}

enum BodyRead {
    Body(Bytes),
    Bad(ClientError),
    Eof,
}

/// Reads a put body of `n_bytes` plus its CRLF trailer. An oversized
/// declaration is rejected without reading: the stream is then out of sync,
/// which the terminal CLIENT_ERROR reply accounts for.
async fn read_put_body<T: tokio::io::AsyncRead + Unpin>(
    server: &Server,
    reader: &mut LineReader<T>,
    n_bytes: u32,
) -> Result<BodyRead> {
    if n_bytes > server.max_job_size() {
        return Ok(BodyRead::Bad(ClientError::JobTooBig));
    }

    let data = reader
        .read_data(n_bytes as usize + 2)
        .await
        .context("reading job body")?;

    Ok(match data {
        None => BodyRead::Eof,
        Some(data) if !data.ends_with(b"\r\n") => {
            BodyRead::Bad(ClientError::ExpectedCrlf)
        },
        Some(data) => BodyRead::Body(data.slice(0..data.len() - 2)),
    })
}

/// Writes out a reply buffer with cancel safety, in the same slightly
/// convoluted shape as the read side.
async fn write_reply(
    cancel: &CancellationToken,
    write: &mut WriteHalf<'_>,
    resp: &[u8],
) -> Result<()> {
    let mut resp_buf = resp;
    select! {
        n = write.write_all_buf(&mut resp_buf) => n.context("writing reply")?,
        _ = cancel.cancelled() => {},
    };

    Ok(())
}

fn bytes_to_human_str(input: &[u8]) -> String {
    String::from_utf8(
        input
            .iter()
            .flat_map(|&c| ascii::escape_default(c))
            .collect::<Vec<u8>>(),
    )
    .unwrap_or_default()
}
