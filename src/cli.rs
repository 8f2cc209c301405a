use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub struct FilterArgs {
    /// Only products in any of these category ids (comma separated)
    #[clap(short, long, value_delimiter = ',')]
    pub category: Vec<u64>,

    /// Minimum price, inclusive
    #[clap(long)]
    pub min_price: Option<f64>,

    /// Maximum price, inclusive
    #[clap(long)]
    pub max_price: Option<f64>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ListAction {
    /// Create a new list
    Create {
        /// List name
        name: String,

        /// Optional description
        #[clap(short, long)]
        description: Option<String>,
    },
    /// Add a product to a list
    Add {
        /// List id
        list: String,

        /// Product sku
        sku: String,

        #[clap(short, long, default_value = "1")]
        quantity: u32,

        #[clap(short, long)]
        notes: Option<String>,
    },
    /// Print a list
    Show {
        /// List id
        list: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the http server and background workers
    Daemon {
        /// Address to listen on
        #[clap(long, default_value = "0.0.0.0:8080")]
        addr: String,
    },

    /// Import a catalog feed and embed the imported products
    Import {
        /// Path to a JSON feed
        feed: PathBuf,

        /// Return right after queueing instead of waiting for the jobs
        #[clap(long, default_value = "false")]
        no_wait: bool,
    },

    /// Recompute embeddings
    Embed {
        /// Only this product; all active products when omitted
        #[clap(long)]
        sku: Option<String>,
    },

    /// Remove vectors of products that are no longer active
    Reconcile {},

    /// Search products
    Search {
        query: String,

        #[command(flatten)]
        filters: FilterArgs,

        #[clap(short, long)]
        page: Option<usize>,

        #[clap(long)]
        page_size: Option<usize>,
    },

    /// Manage shopping lists
    List {
        /// Session that owns the list
        #[clap(short, long, default_value = "cli")]
        session: String,

        #[command(subcommand)]
        action: ListAction,
    },

    /// Issue a share code for a list
    Share {
        /// List id
        list: String,

        /// Session that owns the list
        #[clap(short, long, default_value = "cli")]
        session: String,
    },

    /// Copy a shared list into a session
    Sync {
        /// Share code
        code: String,

        /// Session receiving the copy
        #[clap(short, long)]
        session: String,
    },
}
