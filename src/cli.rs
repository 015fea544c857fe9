use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "bundle-cart")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Config file path
    #[arg(short, long, default_value = "bundle-cart.json")]
    pub config: PathBuf,

    /// Cart to operate on (default: the global cart)
    #[arg(long)]
    pub cart: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add a file to the cart
    Add {
        res_id: String,
        file_path: String,
        url: String,

        /// File size in bytes
        #[arg(long)]
        size: Option<u64>,

        /// Select the file for download
        #[arg(long)]
        select: bool,
    },

    /// List cart contents
    List,

    /// Select every file under a resource, or one file or directory in it
    Select {
        res_id: String,
        file_path: Option<String>,
    },

    /// Remove selected files from the cart
    RemoveSelected,

    /// Remove downloaded files from the cart
    RemoveDownloaded,

    /// Show the status of every known cart
    Status,

    /// Delete carts that are no longer in use
    Cleanup,

    /// Plan and download the selected files as zip bundles
    Download {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}
