use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "autoquest")]
#[command(about = "Batch research extraction through a browser-driven AI assistant")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Create default configuration file at ./config/autoquest.toml
    #[arg(long, global = true)]
    pub init: bool,

    /// Verbose logging (use -v for INFO, -vv for DEBUG)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a batch: query the assistant for every entity/field pair
    Run {
        /// Entity spreadsheet (.xlsx or .csv, first column or a
        /// name/company column holds the entity name)
        #[arg(short, long, value_name = "FILE")]
        entities: String,

        /// Field template file (.xlsx or .csv with field,template[,kind] columns)
        #[arg(short, long, value_name = "FILE")]
        templates: String,

        /// Output workbook path
        #[arg(short, long, value_name = "FILE", default_value = "results.xlsx")]
        output: String,

        /// Resume an earlier batch by id instead of starting a new one
        #[arg(long, value_name = "ID")]
        batch_id: Option<String>,

        /// Chrome remote-debugging port to attach to (overrides config)
        #[arg(long, value_name = "PORT")]
        debug_port: Option<u16>,

        /// Override configured fields packed per assistant exchange
        #[arg(long, value_name = "N")]
        fields_per_query: Option<usize>,
    },

    /// Show checkpointed progress for a batch without running anything
    Status {
        /// Batch id to inspect
        #[arg(long, value_name = "ID")]
        batch_id: String,
    },
}

impl Cli {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(Commands::Run {
            entities,
            templates,
            fields_per_query,
            ..
        }) = &self.command
        {
            if entities.is_empty() {
                return Err("Entities file cannot be empty".to_string());
            }
            if templates.is_empty() {
                return Err("Templates file cannot be empty".to_string());
            }
            if let Some(n) = fields_per_query {
                if *n == 0 || *n > 10 {
                    return Err("fields-per-query must be between 1 and 10".to_string());
                }
            }
        }
        Ok(())
    }
}
