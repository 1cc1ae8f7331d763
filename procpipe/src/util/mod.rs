mod process;

pub use process::{exit_code, is_process_alive, send_signal};
