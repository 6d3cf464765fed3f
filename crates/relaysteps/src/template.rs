use minijinja::{Environment, UndefinedBehavior};
use relaycore::{StepError, WorkingState};

fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    // A typo in a path must fail the node, not send an empty prompt or URL
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env
}

/// Render a Jinja template against the working state.
///
/// The run input is `input` and each completed node's output sits under
/// its id, so `{{ input.topic }}` and `{{ grade.score }}` both resolve.
/// Syntax errors and undefined variables are configuration errors.
pub fn render(template: &str, state: &WorkingState) -> Result<String, StepError> {
    let ctx = minijinja::Value::from_serialize(state.to_json());
    environment()
        .render_str(template, ctx)
        .map_err(|e| StepError::Configuration(format!("template: {}", e)))
}
