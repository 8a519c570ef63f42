use colored::Colorize;
use telc::cli;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("{} {e:#}", "error:".red().bold());
        std::process::exit(1);
    }
}
