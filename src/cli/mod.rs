pub mod actions;
pub mod commands;
pub mod dispatch;
pub mod start;

pub use start::start;

#[cfg(test)]
mod tests {
    use super::actions::Action;
    use anyhow::Result;

    #[test]
    fn start_is_callable_at_module_root() {
        // The binaries call `cli::start()`; keep the function re-exported.
        let _: fn() -> Result<Action> = super::start;
    }
}
