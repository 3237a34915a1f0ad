//! Conversions between wire messages and `genid` protocol types.

use crate::Error;
use crate::proto::{CommandReply, CommandRequest, command_reply};
use genid::{Command, Reply};

impl From<CommandRequest> for Command {
    fn from(req: CommandRequest) -> Self {
        Self {
            verb: req.verb,
            args: req.args,
        }
    }
}

impl From<Command> for CommandRequest {
    fn from(cmd: Command) -> Self {
        Self {
            verb: cmd.verb,
            args: cmd.args,
        }
    }
}

impl From<Reply> for CommandReply {
    fn from(reply: Reply) -> Self {
        let reply = match reply {
            Reply::Status(s) => command_reply::Reply::Status(s),
            Reply::Integer(n) => command_reply::Reply::Integer(n),
            Reply::Text(s) => command_reply::Reply::Text(s),
            Reply::Error(s) => command_reply::Reply::Error(s),
        };
        Self { reply: Some(reply) }
    }
}

impl TryFrom<CommandReply> for Reply {
    type Error = Error;

    /// Fails when the `reply` oneof is unset, which a conforming server
    /// never sends.
    fn try_from(reply: CommandReply) -> Result<Self, Self::Error> {
        match reply.reply {
            Some(command_reply::Reply::Status(s)) => Ok(Self::Status(s)),
            Some(command_reply::Reply::Integer(n)) => Ok(Self::Integer(n)),
            Some(command_reply::Reply::Text(s)) => Ok(Self::Text(s)),
            Some(command_reply::Reply::Error(s)) => Ok(Self::Error(s)),
            None => Err(Error::InvalidRequest {
                reason: "reply is empty".to_owned(),
            }),
        }
    }
}
