//! MiniJinja rendering for the iPXE script and PXELINUX templates.

use minijinja::value::Value;
use minijinja::Environment;

/// Render a one-off template source against a context.
pub fn render(source: &str, ctx: Value) -> Result<String, minijinja::Error> {
    let env = Environment::new();
    env.render_str(source, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::context;

    #[test]
    fn renders_simple_template() {
        let out = render("DEFAULT {{ mac }}", context! { mac => "aa:bb" }).unwrap();
        assert_eq!(out, "DEFAULT aa:bb");
    }

    #[test]
    fn bad_template_is_an_error() {
        assert!(render("{{ unclosed", context! {}).is_err());
    }
}
