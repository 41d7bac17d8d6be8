use crate::commands::{execute, CommandResult};

pub fn run() -> CommandResult {
    execute("migrate", |_config, _pool| async { Ok("applied pending migrations".to_string()) })
}
