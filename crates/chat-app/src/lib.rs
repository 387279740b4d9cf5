pub mod app;
pub mod settings;

pub use app::{AppError, AppResult, Command, TerminalApp, TranscriptPrinter, parse_command};
pub use settings::{AppSettings, SettingsError, SettingsStore};
