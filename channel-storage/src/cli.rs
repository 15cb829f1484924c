use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a store node until ctrl-c.
    Serve(ServeArgs),
    /// Print the value stored under a key.
    Get(KeyArgs),
    /// Store a value under a key.
    Put(PutArgs),
    /// Remove a key.
    Delete(KeyArgs),
    /// Print every key and value under a prefix.
    List(ListArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// JSON config file; built-in defaults are used when omitted.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct EndpointArgs {
    /// Store endpoint to talk to.
    #[arg(long, default_value = "http://127.0.0.1:2379")]
    pub endpoint: String,
}

#[derive(Args, Debug, Clone)]
pub struct KeyArgs {
    pub key: String,

    #[command(flatten)]
    pub endpoint: EndpointArgs,
}

#[derive(Args, Debug, Clone)]
pub struct PutArgs {
    pub key: String,
    pub value: String,

    #[command(flatten)]
    pub endpoint: EndpointArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    /// Key prefix; empty lists everything.
    #[arg(default_value = "")]
    pub prefix: String,

    #[command(flatten)]
    pub endpoint: EndpointArgs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_takes_key_value_and_endpoint() {
        let cli = Cli::parse_from([
            "channel-storage",
            "put",
            "greeting",
            "hello",
            "--endpoint",
            "127.0.0.1:4000",
        ]);
        match cli.command {
            Command::Put(args) => {
                assert_eq!(args.key, "greeting");
                assert_eq!(args.value, "hello");
                assert_eq!(args.endpoint.endpoint, "127.0.0.1:4000");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn list_prefix_defaults_to_everything() {
        let cli = Cli::parse_from(["channel-storage", "list"]);
        match cli.command {
            Command::List(args) => {
                assert_eq!(args.prefix, "");
                assert_eq!(args.endpoint.endpoint, "http://127.0.0.1:2379");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
