pub const DEFAULT_PORT: u16 = 6379;

/// Startup configuration. `replica_of` holds the leader's `host:port` when
/// the process should come up as a follower.
pub struct Config {
    pub port: u16,
    pub replica_of: Option<String>,
}

impl Config {
    pub fn from_args(args: &[String]) -> Result<Config, String> {
        let mut port = DEFAULT_PORT;
        let mut replica_of = None;

        let mut arg_index = 1;
        while arg_index < args.len() {
            match args[arg_index].as_str() {
                "--port" => {
                    if arg_index + 1 < args.len() {
                        port = args[arg_index + 1]
                            .parse::<u16>()
                            .map_err(|_| "Argument Error: --port requires a port number".to_string())?;
                        arg_index += 2;
                    } else {
                        return Err("Argument Error: --port option requires an argument".into());
                    }
                }
                "--replicaof" => {
                    if arg_index + 1 < args.len() {
                        let leader_location = args[arg_index + 1].clone();
                        let leader_location_split: Vec<&str> =
                            leader_location.split_whitespace().collect();

                        if leader_location_split.len() == 2 {
                            replica_of = Some(format!(
                                "{}:{}",
                                leader_location_split[0], leader_location_split[1]
                            ));
                            arg_index += 2;
                        } else {
                            return Err("Argument Error: --replicaof requires a host and port (e.g., 'localhost 6379')".into());
                        }
                    } else {
                        return Err("Argument Error: --replicaof requires a host and port (e.g., 'localhost 6379')".into());
                    }
                }
                _ => {
                    return Err(format!(
                        "Argument Error: '{}' is an unknown option",
                        args[arg_index]
                    ))
                }
            }
        }

        Ok(Config { port, replica_of })
    }
}
