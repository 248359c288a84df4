use std::sync::mpsc::{Receiver, SyncSender, sync_channel};

use crate::cmd::RespType;
use crate::err::SdError;

/// Work item for a controller worker.
#[derive(Debug)]
pub enum Message {
    Plug,
    Unplug,
    Request(Request),
    SdioRescan,
}

#[derive(Debug)]
pub enum Request {
    Read { start: u32, count: u32 },
    Write { start: u32, data: Vec<u8> },
    Erase { start: u32, count: u32 },
    /// Raw command without data phase.
    Command { opcode: u32, arg: u32, resp_type: RespType },
}

#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    Done,
    Data(Vec<u8>),
    Response([u32; 4]),
}

pub type Completion = Result<Reply, SdError>;

/// A queued message and, for blocking submitters, where to post the result.
pub(crate) struct Envelope {
    pub(crate) msg: Message,
    pub(crate) done: Option<SyncSender<Completion>>,
}

impl Envelope {
    pub(crate) fn detached(msg: Message) -> Self {
        Self { msg, done: None }
    }

    pub(crate) fn blocking(msg: Message) -> (Self, Receiver<Completion>) {
        let (tx, rx) = sync_channel(1);
        (Self { msg, done: Some(tx) }, rx)
    }

    pub(crate) fn complete(self, result: Completion) {
        if let Some(done) = self.done {
            // submitter may have given up waiting
            let _ = done.send(result);
        }
    }
}
