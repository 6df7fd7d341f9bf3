//! stepwright CLI binary
//!
//! All logic is in the library; main.rs only invokes cli::run().

fn main() {
    // cli::run() writes all output, including error reports
    if let Err(code) = stepwright::cli::run() {
        std::process::exit(code.as_i32());
    }
}
