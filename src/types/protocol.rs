use bytes::Bytes;

use super::serialisable::BeanstalkSerialisable;

/// A command sent by the client to the server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// `put <pri> <delay> <ttr> <bytes>`, followed by the job body
    Put {
        pri: u32,
        delay: u32,
        ttr: u32,
        n_bytes: u32,
    },
    /// `reserve`
    Reserve,
    /// `delete <id>`
    Delete { id: u64 },
    /// `release <id> <pri> <delay>`
    Release { id: u64, pri: u32, delay: u32 },
    /// `bury <id> <pri>`
    Bury { id: u64, pri: u32 },
    /// `kick <bound>`
    Kick { bound: u64 },
    /// `peek` -- the buried head if any, else the next-to-fire delayed job
    Peek,
    /// `peek <id>`
    PeekJob { id: u64 },
    /// `stats`
    Stats,
    /// `stats <id>`
    StatsJob { id: u64 },
}

/// A reply sent by the server.
///
/// Job-bearing replies carry the body, written after the reply line and
/// terminated with a trailing CRLF. Body byte counts on the wire exclude
/// that framing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Reply {
    /// `INSERTED <id>`
    Inserted { id: u64 },
    /// `BURIED <id>` -- a put that overflowed the ready or delay queue
    BuriedId { id: u64 },
    /// `RESERVED <id> <pri> <bytes>` + body
    Reserved { id: u64, pri: u32, body: Bytes },
    /// `FOUND <id> <pri> <bytes>` + body
    Found { id: u64, pri: u32, body: Bytes },
    /// `DELETED`
    Deleted,
    /// `RELEASED`
    Released,
    /// `BURIED`
    Buried,
    /// `NOT_FOUND`
    NotFound,
    /// `KICKED <count>`
    Kicked { count: u64 },
    /// `OK <bytes>` + body (stats)
    Ok { body: Bytes },
    ClientError(ClientError),
    ServerError(ServerError),
}

impl Reply {
    /// True if the server must close the connection after sending this.
    /// Client errors always close: the parser cannot resynchronise with the
    /// stream. Internal errors close because core state for this connection
    /// is suspect.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            Reply::ClientError(_) | Reply::ServerError(ServerError::Internal)
        )
    }
}

/// `CLIENT_ERROR <code> <msg>` replies.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientError {
    BadFormat,
    UnknownCommand,
    ExpectedCrlf,
    JobTooBig,
}

/// `SERVER_ERROR <code> <msg>` replies.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServerError {
    OutOfMemory,
    Internal,
    Draining,
}

fn job_reply(word: &str, id: u64, pri: u32, body: &Bytes) -> Vec<u8> {
    let mut out = format!("{word} {id} {pri} {}\r\n", body.len()).into_bytes();
    out.extend_from_slice(body);
    out.extend_from_slice(b"\r\n");
    out
}

impl BeanstalkSerialisable for Reply {
    fn serialise_beanstalk(&self) -> Vec<u8> {
        match self {
            Reply::Inserted { id } => format!("INSERTED {id}\r\n").into_bytes(),
            Reply::BuriedId { id } => format!("BURIED {id}\r\n").into_bytes(),
            Reply::Reserved { id, pri, body } => {
                job_reply("RESERVED", *id, *pri, body)
            },
            Reply::Found { id, pri, body } => {
                job_reply("FOUND", *id, *pri, body)
            },
            Reply::Deleted => b"DELETED\r\n".to_vec(),
            Reply::Released => b"RELEASED\r\n".to_vec(),
            Reply::Buried => b"BURIED\r\n".to_vec(),
            Reply::NotFound => b"NOT_FOUND\r\n".to_vec(),
            Reply::Kicked { count } => {
                format!("KICKED {count}\r\n").into_bytes()
            },
            Reply::Ok { body } => {
                let mut out = format!("OK {}\r\n", body.len()).into_bytes();
                out.extend_from_slice(body);
                out.extend_from_slice(b"\r\n");
                out
            },
            Reply::ClientError(e) => e.serialise_beanstalk(),
            Reply::ServerError(e) => e.serialise_beanstalk(),
        }
    }
}

impl BeanstalkSerialisable for ClientError {
    fn serialise_beanstalk(&self) -> Vec<u8> {
        match self {
            Self::BadFormat => {
                b"CLIENT_ERROR 0 bad command line format\r\n".to_vec()
            },
            Self::UnknownCommand => {
                b"CLIENT_ERROR 1 unknown command\r\n".to_vec()
            },
            Self::ExpectedCrlf => {
                b"CLIENT_ERROR 2 expected CR-LF after job body\r\n".to_vec()
            },
            Self::JobTooBig => b"CLIENT_ERROR 3 job too big\r\n".to_vec(),
        }
    }
}

impl BeanstalkSerialisable for ServerError {
    fn serialise_beanstalk(&self) -> Vec<u8> {
        match self {
            Self::OutOfMemory => b"SERVER_ERROR 0 out of memory\r\n".to_vec(),
            Self::Internal => b"SERVER_ERROR 1 internal error\r\n".to_vec(),
            Self::Draining => b"SERVER_ERROR 2 draining\r\n".to_vec(),
        }
    }
}
