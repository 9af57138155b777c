use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "matura", version, about = "Matura: paired-account maturation scheduler")]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the scheduler: one supervised loop per running pair, plus the
    /// cron sweep and webhook server when configured.
    Start,
    /// Run a single sweep pass over running pairs and exit.
    Sweep,
    Pair {
        #[command(subcommand)]
        command: PairCommands,
    },
    /// Validate the config file and probe the channel.
    Check,
    Version,
}

#[derive(Subcommand)]
pub(crate) enum PairCommands {
    Create {
        /// Pair id (defaults to a random UUID).
        #[arg(long)]
        id: Option<String>,

        /// Identity name of member A (speaks on even turns).
        member_a: String,

        /// Identity name of member B.
        member_b: String,

        /// Drive the pair from a configured script instead of the model.
        #[arg(long)]
        script: Option<String>,

        /// Restart the script from the top when it runs out.
        #[arg(long = "loop", requires = "script")]
        looped: bool,
    },
    Delete {
        id: String,
    },
    Start {
        id: String,
    },
    Pause {
        id: String,
    },
    Stop {
        id: String,
    },
    List,
    History {
        id: String,

        /// Number of recent turns to print.
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
}
