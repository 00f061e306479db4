//! Utility functions for process management, filesystem operations, and
//! id generation.

pub mod fs;
pub mod id;
pub mod poll;
pub mod process;
pub mod size;

pub use fs::{atomic_write_json, ensure_dirs, scan_file_stems, scan_subdirs, valid_file};
pub use id::{generate_id, generate_mac, uuid_v5};
pub use poll::wait_for;
pub use process::{
    is_process_alive, read_pid_file, terminate_process, verify_process_cmdline, write_pid_file,
};
pub use size::parse_size;
