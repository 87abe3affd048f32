pub mod archive;
pub mod atomic_file;
pub mod backup_config;
pub mod engine;
pub mod finish;
pub mod hasher;
pub mod metadata;
pub mod redacted;
pub mod restore;
pub mod result_error;
pub mod scheduler;
pub mod service;
pub mod validate;
pub mod watch_set;
pub mod watcher;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
