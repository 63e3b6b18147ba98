//! Print the task names this process registers.

use std::process::ExitCode;

use taskq::{TaskRegistry, sample_tasks};

fn main() -> ExitCode {
    let mut registry = TaskRegistry::new();
    if let Err(registry_error) = sample_tasks::register_sample_tasks(&mut registry) {
        eprintln!("task registration failed: {registry_error}");
        return ExitCode::from(1);
    }

    let names = registry.names();
    if names.is_empty() {
        println!("No tasks registered.");
        return ExitCode::SUCCESS;
    }

    println!("Registered tasks:");
    for name in &names {
        println!("  • {name}");
    }
    println!("Total: {} tasks", names.len());
    ExitCode::SUCCESS
}
