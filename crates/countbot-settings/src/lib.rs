pub mod db;
pub mod error;
pub mod personality;
pub mod settings;

pub use error::{Result, SettingsError};
pub use personality::{Personality, PersonalityStore};
pub use settings::SettingsStore;
