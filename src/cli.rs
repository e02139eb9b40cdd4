use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "vmhub",
    version,
    about = "Content-addressed VM image hub: push, pull and serve disk images",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum PullPolicyArg {
    Always,
    IfNotPresent,
    Never,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Store credentials for the configured hub
    Auth {
        #[arg(long, help = "API token")]
        token: Option<String>,

        #[arg(long, help = "Username for basic auth")]
        username: Option<String>,

        #[arg(long, help = "Password for basic auth")]
        password: Option<String>,

        #[arg(long, help = "Hub base URL, e.g. http://hub.example.com:9091")]
        api_url: Option<String>,
    },

    /// Upload a local image (chunked automatically above the threshold)
    Push {
        #[arg(help = "Image reference: [user/]name[:tag]")]
        image: String,

        #[arg(long, help = "Overwrite an existing image at the same tag")]
        force: bool,

        #[arg(long, default_value = "qcow2", help = "Image format: qcow2, raw")]
        format: String,

        #[arg(long, default_value = "linux", help = "Guest OS type")]
        os_type: String,

        #[arg(long, default_value = "ubuntu", help = "Guest OS distribution")]
        os_distrib: String,

        #[arg(long, default_value = "", help = "Guest OS version")]
        os_version: String,

        #[arg(long, default_value = "amd64", help = "Guest architecture")]
        arch: String,

        #[arg(long, help = "Mark the repository private")]
        private: bool,

        #[arg(long, default_value = "", help = "Image description")]
        description: String,

        #[arg(long, help = "Let the server fetch the image from this URL")]
        url: Option<String>,

        #[arg(long, help = "Chunk size for chunked uploads, e.g. 100M")]
        chunk_size: Option<String>,

        #[arg(long, help = "Size above which uploads are chunked, e.g. 1G")]
        threshold: Option<String>,
    },

    /// Download an image into the local registry
    Pull {
        #[arg(help = "Image reference: [user/]name[:tag]")]
        image: String,

        #[arg(long, value_enum, help = "When to fetch: always, if-not-present, never")]
        policy: Option<PullPolicyArg>,

        #[arg(long, help = "Chunk size for chunked downloads, e.g. 100M")]
        chunk_size: Option<String>,

        #[arg(long, help = "Size above which downloads are chunked, e.g. 1G")]
        threshold: Option<String>,
    },

    /// Show server-side metadata for an image
    Info {
        #[arg(help = "Image reference: [user/]name[:tag]")]
        image: String,
    },

    /// List images on the hub
    Ls {
        #[arg(long, help = "Restrict to a user's namespace")]
        username: Option<String>,

        #[arg(long, default_value_t = 1)]
        page: usize,

        #[arg(long, default_value_t = 10)]
        page_size: usize,
    },

    /// List images in the local registry
    LsLocal,

    /// Delete an image from the hub (and the local copy, if any)
    Rm {
        #[arg(help = "Image reference: [user/]name[:tag]")]
        image: String,
    },

    /// Delete an image from the local registry only
    RmLocal {
        #[arg(help = "Image reference: [user/]name[:tag]")]
        image: String,
    },

    /// Run the hub server
    Serve {
        #[arg(short, long, help = "Path to the server config JSON")]
        config: PathBuf,
    },
}
