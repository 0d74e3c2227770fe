mod cli;
mod healthcheck;
mod logging;
mod server;

fn main() {
    if let Err(error) = cli::execute() {
        logging::ensure_log_error(&error);
        std::process::exit(1);
    }
}
