pub const SIMPLE_STRING_PREFIX: u8 = b'+';
pub const ERROR_PREFIX: u8 = b'-';
pub const INTEGER_PREFIX: u8 = b':';
pub const BULK_STRING_PREFIX: u8 = b'$';
pub const ARRAY_PREFIX: u8 = b'*';
pub const CRLF: &str = "\r\n";

// Verbs, lowercased the way commands are normalized in memory.
pub const PING_COMMAND: &str = "ping";
pub const ECHO_COMMAND: &str = "echo";
pub const GET_COMMAND: &str = "get";
pub const SET_COMMAND: &str = "set";
pub const INFO_COMMAND: &str = "info";
pub const REPLCONF_COMMAND: &str = "replconf";
pub const PSYNC_COMMAND: &str = "psync";
pub const WAIT_COMMAND: &str = "wait";

pub const PX_OPTION: &str = "px";
pub const EX_OPTION: &str = "ex";

pub const LISTENING_PORT_OPTION: &str = "listening-port";
pub const CAPA_OPTION: &str = "capa";
pub const PSYNC2_CAPA: &str = "psync2";
pub const GETACK_OPTION: &str = "getack";
pub const ACK_OPTION: &str = "ack";

pub const PONG_RESPONSE: &str = "PONG";
pub const OK_RESPONSE: &str = "OK";
pub const FULLRESYNC_RESPONSE: &str = "FULLRESYNC";

pub const MASTER_ROLE: &str = "master";
pub const SLAVE_ROLE: &str = "slave";
pub const REPLID_LEN: usize = 40;

// Snapshot framing.
pub const MAGIC_NUMBER: &[u8] = b"REDIS";
pub const SNAPSHOT_VERSION: &[u8] = b"0011";
pub const OPCODE_EOF: u8 = 0xFF;

// Error messages
pub const SET_ARGUMENTS_ERROR: &str = "SET requires at least key and value arguments";
pub const UNKNOWN_OPTION_ERROR: &str = "Unknown option";
pub const INVALID_OPTION_VALUE_ERROR: &str = "Invalid option value";
pub const OPTION_ARGUMENT_MISSING_ERROR: &str = "Option requires an argument";
pub const REPLCONF_ARGUMENTS_ERROR: &str = "REPLCONF requires a subcommand";
pub const PSYNC_ARGUMENTS_ERROR: &str = "PSYNC requires a replication id and an offset";
pub const WAIT_ARGUMENTS_ERROR: &str = "WAIT requires a replica count and a timeout";
