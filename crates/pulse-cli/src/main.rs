#![forbid(unsafe_code)]

fn main() {
    std::process::exit(pulse_cli::run());
}
