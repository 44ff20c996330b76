mod error;
mod http;
mod locate;
mod profile;
mod supervisor;

pub use error::ChromeError;
pub use http::{
    BrowserVersion, TargetSummary, activate_target, close_target, is_real_chromium, open_page,
    query_targets, query_version,
};
pub use locate::{default_user_data_dir, find_chromium_executable};
pub use profile::{ShadowProfile, build_shadow_profile, remove_singleton_locks};
pub use supervisor::{ManagedProcess, ProfileRequest, SpawnOutcome, ensure_browser, kill_process_tree};
