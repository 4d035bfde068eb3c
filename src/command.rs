use crate::errors::ArgumentError;
use crate::protocol_constants::*;
use crate::resp::{Frame, Value};
use bytes::Bytes;

/// A normalized inbound command. The frame it was decoded from travels along:
/// its bytes are what gets mirrored to followers, and its length is what
/// advances the replication offsets.
pub struct Command {
    pub kind: CommandKind,
    pub frame: Frame,
}

pub enum CommandKind {
    Ping,
    Echo(Bytes),
    Get(Bytes),
    Set {
        key: Bytes,
        value: Bytes,
        expiry_ms: Option<u64>,
    },
    Info,
    Replconf(ReplconfCommand),
    Psync,
    Wait {
        required: usize,
        timeout_ms: u64,
    },
    Unknown(String),
}

pub enum ReplconfCommand {
    ListeningPort(String),
    Capa,
    GetAck,
    Ack(u64),
}

impl Command {
    pub fn from_frame(frame: Frame) -> Result<Command, ArgumentError> {
        let kind = match normalize(&frame.value) {
            Some((verb, args)) => match verb.as_str() {
                PING_COMMAND => CommandKind::Ping,
                ECHO_COMMAND => parse_echo(&args)?,
                GET_COMMAND => parse_get(&args)?,
                SET_COMMAND => parse_set(&args)?,
                INFO_COMMAND => CommandKind::Info,
                REPLCONF_COMMAND => parse_replconf(&args)?,
                PSYNC_COMMAND => parse_psync(&args)?,
                WAIT_COMMAND => parse_wait(&args)?,
                _ => CommandKind::Unknown(verb),
            },
            None => CommandKind::Unknown(String::new()),
        };
        Ok(Command { kind, frame })
    }

    /// Mutating commands are the ones mirrored to followers.
    pub fn is_mutating(&self) -> bool {
        matches!(self.kind, CommandKind::Set { .. })
    }
}

/// Extracts the lowercased verb and the argument list from the shapes a
/// command can arrive in: an array of bulk strings, a bare simple string, or
/// a bare bulk string.
fn normalize(value: &Value) -> Option<(String, Vec<Bytes>)> {
    match value {
        Value::Array(items) => {
            let Some(Value::BulkString(first)) = items.first() else {
                return None;
            };
            let verb = String::from_utf8_lossy(first).to_lowercase();
            let args = items[1..]
                .iter()
                .filter_map(|item| match item {
                    Value::BulkString(arg) => Some(arg.clone()),
                    _ => None,
                })
                .collect();
            Some((verb, args))
        }
        Value::SimpleString(text) => Some((text.to_lowercase(), Vec::new())),
        Value::BulkString(payload) => {
            Some((String::from_utf8_lossy(payload).to_lowercase(), Vec::new()))
        }
        _ => None,
    }
}

fn parse_echo(args: &[Bytes]) -> Result<CommandKind, ArgumentError> {
    // Extra arguments are tolerated; only the first is echoed.
    match args.first() {
        Some(message) => Ok(CommandKind::Echo(message.clone())),
        None => Err(ArgumentError::General("ECHO requires a message".into())),
    }
}

fn parse_get(args: &[Bytes]) -> Result<CommandKind, ArgumentError> {
    match args.first() {
        Some(key) => Ok(CommandKind::Get(key.clone())),
        None => Err(ArgumentError::General("GET requires a key".into())),
    }
}

fn parse_set(args: &[Bytes]) -> Result<CommandKind, ArgumentError> {
    if args.len() < 2 {
        return Err(ArgumentError::General(SET_ARGUMENTS_ERROR.into()));
    }

    let key = args[0].clone();
    let value = args[1].clone();
    let mut expiry_ms = None;

    let mut arg_index = 2;
    while arg_index < args.len() {
        let option = String::from_utf8_lossy(&args[arg_index]).to_lowercase();
        match option.as_str() {
            PX_OPTION => {
                expiry_ms = Some(parse_option_value(args, arg_index, PX_OPTION)?);
                arg_index += 2;
            }
            EX_OPTION => {
                expiry_ms = Some(parse_option_value(args, arg_index, EX_OPTION)? * 1000);
                arg_index += 2;
            }
            _ => {
                return Err(ArgumentError::General(format!(
                    "{}: '{}'",
                    UNKNOWN_OPTION_ERROR, option
                )))
            }
        }
    }

    Ok(CommandKind::Set {
        key,
        value,
        expiry_ms,
    })
}

fn parse_option_value(args: &[Bytes], index: usize, option: &str) -> Result<u64, ArgumentError> {
    match args.get(index + 1) {
        Some(raw) => std::str::from_utf8(raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                ArgumentError::General(format!("{}: {}", INVALID_OPTION_VALUE_ERROR, option))
            }),
        None => Err(ArgumentError::General(format!(
            "{}: {}",
            OPTION_ARGUMENT_MISSING_ERROR, option
        ))),
    }
}

fn parse_replconf(args: &[Bytes]) -> Result<CommandKind, ArgumentError> {
    let Some(subcommand) = args.first() else {
        return Err(ArgumentError::General(REPLCONF_ARGUMENTS_ERROR.into()));
    };

    let subcommand = String::from_utf8_lossy(subcommand).to_lowercase();
    let parsed = match subcommand.as_str() {
        LISTENING_PORT_OPTION => {
            let Some(port) = args.get(1) else {
                return Err(ArgumentError::General(format!(
                    "{}: {}",
                    OPTION_ARGUMENT_MISSING_ERROR, LISTENING_PORT_OPTION
                )));
            };
            ReplconfCommand::ListeningPort(String::from_utf8_lossy(port).into_owned())
        }
        CAPA_OPTION => ReplconfCommand::Capa,
        GETACK_OPTION => ReplconfCommand::GetAck,
        ACK_OPTION => {
            let offset = args
                .get(1)
                .and_then(|raw| std::str::from_utf8(raw).ok())
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    ArgumentError::General(format!("{}: {}", INVALID_OPTION_VALUE_ERROR, ACK_OPTION))
                })?;
            ReplconfCommand::Ack(offset)
        }
        other => {
            return Err(ArgumentError::General(format!(
                "{}: '{}'",
                UNKNOWN_OPTION_ERROR, other
            )))
        }
    };
    Ok(CommandKind::Replconf(parsed))
}

fn parse_psync(args: &[Bytes]) -> Result<CommandKind, ArgumentError> {
    if args.len() < 2 {
        return Err(ArgumentError::General(PSYNC_ARGUMENTS_ERROR.into()));
    }
    Ok(CommandKind::Psync)
}

fn parse_wait(args: &[Bytes]) -> Result<CommandKind, ArgumentError> {
    if args.len() < 2 {
        return Err(ArgumentError::General(WAIT_ARGUMENTS_ERROR.into()));
    }
    let required = std::str::from_utf8(&args[0])
        .ok()
        .and_then(|s| s.parse().ok());
    let timeout_ms = std::str::from_utf8(&args[1])
        .ok()
        .and_then(|s| s.parse().ok());
    match (required, timeout_ms) {
        (Some(required), Some(timeout_ms)) => Ok(CommandKind::Wait {
            required,
            timeout_ms,
        }),
        _ => Err(ArgumentError::General(WAIT_ARGUMENTS_ERROR.into())),
    }
}
