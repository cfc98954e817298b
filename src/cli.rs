use crate::feeds::{DisplayMode, FeedId};
use crate::settings::SettingKey;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "rescue-console",
    version,
    about = "Terminal control console for rescue robots: live camera feeds, captures, weather and emergency messaging"
)]
pub struct Cli {
    /// Directory holding saved feeds, gallery, contacts, settings and config.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    /// Commands that take over the terminal.
    pub fn is_fullscreen(&self) -> bool {
        matches!(self.command, None | Some(Command::Tui | Command::View(_)))
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Open the interactive dashboard.
    Tui,
    /// View one or more MJPEG streams in a terminal grid.
    View(ViewArgs),
    /// Connect every active feed and log state changes until Ctrl-C.
    Watch,
    /// Grab a single frame from a feed into the gallery and downloads folder.
    Capture(CaptureArgs),
    /// Inspect and edit camera feed configuration.
    Feeds(FeedsArgs),
    /// Manage captured frames.
    Gallery(GalleryArgs),
    /// Manage emergency contacts.
    Contacts(ContactsArgs),
    /// Send the emergency SOS message to every contact.
    Sos(SosArgs),
    /// Send a single SMS.
    Sms(SmsArgs),
    /// Show current weather for the robot's location.
    Weather(WeatherArgs),
    /// Show or change robot settings.
    Settings(SettingsArgs),
}

#[derive(Debug, Args)]
pub struct ViewArgs {
    /// Stream URL(s). Repeat the flag or pass a comma-separated list.
    #[arg(short, long = "stream", required = true, num_args = 1.., value_delimiter = ',')]
    pub streams: Vec<String>,

    /// How the URLs are consumed.
    #[arg(long, default_value_t = DisplayMode::Mjpeg)]
    pub mode: DisplayMode,

    /// Fixed number of grid rows (0 = auto).
    #[arg(long, default_value_t = 0)]
    pub rows: u16,

    /// Fixed number of grid columns (0 = auto).
    #[arg(long, default_value_t = 0)]
    pub cols: u16,

    /// Terminal refresh rate.
    #[arg(long, default_value_t = 24)]
    pub refresh_fps: u16,
}

#[derive(Debug, Args)]
pub struct CaptureArgs {
    /// Feed to capture from.
    #[arg(long)]
    pub feed: FeedId,

    /// Directory to write the JPEG into (defaults to the downloads folder).
    #[arg(long)]
    pub out: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct FeedsArgs {
    #[command(subcommand)]
    pub command: FeedsCommand,
}

#[derive(Debug, Subcommand)]
pub enum FeedsCommand {
    /// List every feed with its URL, mode and whether it is shown.
    List(JsonArgs),
    /// Point a feed at a new URL.
    SetUrl { feed: FeedId, url: String },
    /// Show a feed on the dashboard.
    Activate { feed: FeedId },
    /// Hide a feed from the dashboard.
    Deactivate { feed: FeedId },
    /// Change how a feed's URL is presented.
    Mode { feed: FeedId, mode: DisplayMode },
    /// Restore default feeds and camera server settings.
    Reset,
}

#[derive(Debug, Args)]
pub struct GalleryArgs {
    #[command(subcommand)]
    pub command: GalleryCommand,
}

#[derive(Debug, Subcommand)]
pub enum GalleryCommand {
    /// List saved frames.
    List(JsonArgs),
    /// Delete one saved frame.
    Delete { id: String },
    /// Delete every saved frame.
    Clear,
    /// Write a saved frame's JPEG to disk.
    Export {
        id: String,
        /// Target directory (defaults to the downloads folder).
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
pub struct ContactsArgs {
    #[command(subcommand)]
    pub command: ContactsCommand,
}

#[derive(Debug, Subcommand)]
pub enum ContactsCommand {
    List(JsonArgs),
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        phone: String,
        #[arg(long)]
        relationship: Option<String>,
    },
    Update {
        /// Contact id or name.
        contact: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        /// Pass an empty string to clear it.
        #[arg(long)]
        relationship: Option<String>,
    },
    Remove {
        /// Contact id or name.
        contact: String,
    },
}

#[derive(Debug, Args)]
pub struct SosArgs {
    /// Replace the default SOS text.
    #[arg(long)]
    pub message: Option<String>,
}

#[derive(Debug, Args)]
pub struct SmsArgs {
    #[arg(long)]
    pub to: String,
    #[arg(long)]
    pub message: String,
}

#[derive(Debug, Args)]
pub struct WeatherArgs {
    /// One of the preset locations, e.g. "Bengaluru".
    #[arg(long, conflicts_with_all = ["lat", "lon"])]
    pub location: Option<String>,

    #[arg(long, requires = "lon", allow_hyphen_values = true)]
    pub lat: Option<f64>,

    #[arg(long, requires = "lat", allow_hyphen_values = true)]
    pub lon: Option<f64>,

    /// Print machine-readable JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct SettingsArgs {
    #[command(subcommand)]
    pub command: SettingsCommand,
}

#[derive(Debug, Subcommand)]
pub enum SettingsCommand {
    Show(JsonArgs),
    Set { key: SettingKey, value: String },
    Reset,
}

#[derive(Debug, Args)]
pub struct JsonArgs {
    /// Print machine-readable JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}
