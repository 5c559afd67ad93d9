use std::process::ExitCode;

fn main() -> ExitCode {
    match task_memory_metrics_lib::run() {
        Ok(report) => {
            match serde_json::to_string(&report) {
                Ok(summary) => println!("{summary}"),
                Err(error) => eprintln!("failed to encode job report: {error}"),
            }
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("{error:#}");
            ExitCode::FAILURE
        }
    }
}
