fn main() {
    if let Err(err) = taskpulse_lib::run() {
        eprintln!("taskpulse: {err:#}");
        std::process::exit(1);
    }
}
