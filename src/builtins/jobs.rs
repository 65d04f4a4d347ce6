//! Job control intrinsics: `jobs`, `fg` and `bg`
//!
//! These work on the engine's job table rather than on streams, so the
//! sequential executor runs them directly instead of starting a job.

use crate::command::CommandSpec;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::executor::Route;

/// Run `spec` if it names an intrinsic; returns its status
pub(crate) fn run_intrinsic(eng: &mut Engine, spec: &CommandSpec, route: Route) -> Option<i32> {
    let name = spec.name.as_str();
    if !matches!(name, "jobs" | "fg" | "bg") {
        return None;
    }
    let argv = spec.argv(eng.services());
    let args = argv.get(1..).unwrap_or(&[]);

    let result = match name {
        "jobs" => builtin_jobs(eng, args, route),
        "fg" => resume(eng, args, true),
        _ => resume(eng, args, false),
    };
    Some(match result {
        Ok(()) => 0,
        Err(err) => {
            let line = format!("{name}: {err}\n");
            match route {
                Route::Terminal => eng.console.err(line.as_bytes()),
                _ => eng.console.error(line.as_bytes()),
            }
            1
        }
    })
}

fn builtin_jobs(eng: &mut Engine, args: &[String], route: Route) -> Result<(), EngineError> {
    if let Some(arg) = args.first() {
        return Err(EngineError::InvalidJobSpec(arg.clone()));
    }
    let listing = eng.jobs_listing();
    match route {
        Route::Terminal => eng.console.out(listing.as_bytes()),
        _ => eng.console.log(listing.as_bytes()),
    }
    Ok(())
}

/// `fg`/`bg` with an optional job spec (current job by default)
fn resume(eng: &mut Engine, args: &[String], foreground: bool) -> Result<(), EngineError> {
    let spec = args.first().map(String::as_str).unwrap_or("%+");
    let id = eng.table.parse_job_spec(spec)?;
    if foreground {
        eng.fg(id)
    } else {
        eng.bg(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::services::ShellServices;
    use crate::terminal::MemoryConsole;

    fn engine() -> (Engine, MemoryConsole) {
        let console = MemoryConsole::new();
        let config = EngineConfig {
            inherit_terminal: false,
            ..EngineConfig::default()
        };
        (Engine::new(config, ShellServices::new(), console.clone()), console)
    }

    #[test]
    fn test_not_an_intrinsic() {
        let (mut eng, _) = engine();
        assert_eq!(
            run_intrinsic(&mut eng, &CommandSpec::new("echo"), Route::Terminal),
            None
        );
    }

    #[test]
    fn test_fg_without_jobs() {
        let (mut eng, console) = engine();
        let status = run_intrinsic(&mut eng, &CommandSpec::new("fg"), Route::Terminal);
        assert_eq!(status, Some(1));
        assert!(console.stderr().starts_with("fg: %+: invalid job specification"));

        let status = run_intrinsic(&mut eng, &CommandSpec::new("bg").arg("4"), Route::Terminal);
        assert_eq!(status, Some(1));
        assert!(console.stderr().contains("bg: 4: no such job"));
    }

    #[test]
    fn test_empty_listing() {
        let (mut eng, console) = engine();
        assert_eq!(
            run_intrinsic(&mut eng, &CommandSpec::new("jobs"), Route::Terminal),
            Some(0)
        );
        assert_eq!(console.stdout(), "");
    }
}
