//! Maps pipeline and mesh failures onto caller-visible [`BusError`]s using
//! the configured `errors:` templates.

use std::collections::HashMap;

use relaybus_core::{ActionError, BusError, ErrorCode};

use crate::config::ErrorTemplate;
use crate::registry::LoadError;
use crate::template::Template;

#[derive(Debug)]
struct Compiled {
    kind: Option<String>,
    code: Option<ErrorCode>,
    status: Option<u16>,
    title: Option<Template>,
    message: Option<Template>,
    help: Option<Template>,
}

#[derive(Debug, Default)]
pub struct ErrorTranslator {
    templates: HashMap<String, Compiled>,
}

impl ErrorTranslator {
    /// Compiles the placeholder text of every template.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Expr`] for a malformed placeholder.
    pub fn new<'a>(
        templates: impl IntoIterator<Item = (&'a String, &'a ErrorTemplate)>,
    ) -> Result<Self, LoadError> {
        let compile = |text: &Option<String>| text.as_deref().map(Template::compile).transpose();
        let templates = templates
            .into_iter()
            .map(|(name, t)| -> Result<(String, Compiled), LoadError> {
                Ok((
                    name.clone(),
                    Compiled {
                        kind: t.kind.clone(),
                        code: t.code,
                        status: t.status,
                        title: compile(&t.title)?,
                        message: compile(&t.message)?,
                        help: compile(&t.help)?,
                    },
                ))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { templates })
    }

    /// Translation order: a configured template, then a template name that
    /// is itself a code name, then the error's own code, then `internal`.
    /// Metadata is carried through in every case.
    #[must_use]
    pub fn translate(&self, err: &ActionError) -> BusError {
        let template = err.template.as_deref();
        if let Some(compiled) = template.and_then(|name| self.templates.get(name).map(|c| (name, c))) {
            return Self::render(compiled.0, compiled.1, err);
        }

        let (code, kind) = match template.and_then(ErrorCode::lookup) {
            Some(code) => (code, None),
            None => (err.code.unwrap_or(ErrorCode::Internal), template.map(str::to_string)),
        };
        let mut bus = BusError::new(code, err.message.clone());
        bus.kind = kind;
        bus.metadata = err.metadata.clone();
        bus
    }

    fn render(name: &str, t: &Compiled, err: &ActionError) -> BusError {
        // Render failures leave the field unset.
        let render = |tmpl: &Option<Template>| {
            tmpl.as_ref().and_then(|tmpl| tmpl.render(&err.metadata).ok())
        };
        let code = t.code.or(err.code).unwrap_or(ErrorCode::Internal);
        BusError {
            kind: Some(t.kind.clone().unwrap_or_else(|| name.to_string())),
            code,
            status: t.status.unwrap_or_else(|| code.http_status()),
            title: render(&t.title),
            message: render(&t.message).unwrap_or_else(|| err.message.clone()),
            help: render(&t.help),
            path: None,
            metadata: err.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use relaybus_core::Value;

    use super::*;
    use crate::config::BusConfig;

    fn translator() -> ErrorTranslator {
        let config = BusConfig::from_yaml(
            r"
errors:
  user_missing:
    type: UserMissing
    code: not_found
    title: 'No such user'
    message: 'user {{ id }} does not exist'
    help: 'check the id'
  teapot:
    status: 418
    message: 'short and stout'
",
        )
        .unwrap();
        ErrorTranslator::new(&config.errors).unwrap()
    }

    fn metadata(id: i64) -> BTreeMap<String, Value> {
        BTreeMap::from([("id".to_string(), Value::from(id))])
    }

    #[test]
    fn renders_configured_template() {
        let err = translator().translate(&ActionError::template("user_missing", metadata(7)));
        assert_eq!(err.kind.as_deref(), Some("UserMissing"));
        assert_eq!(err.code, ErrorCode::NotFound);
        assert_eq!(err.status, 404);
        assert_eq!(err.title.as_deref(), Some("No such user"));
        assert_eq!(err.message, "user 7 does not exist");
        assert_eq!(err.help.as_deref(), Some("check the id"));
        assert_eq!(err.metadata.get("id"), Some(&Value::from(7)));
    }

    #[test]
    fn template_without_code_keeps_status_override() {
        let err = translator().translate(&ActionError::template("teapot", BTreeMap::new()));
        assert_eq!(err.kind.as_deref(), Some("teapot"));
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.status, 418);
        assert_eq!(err.message, "short and stout");
    }

    #[test]
    fn code_named_template_uses_that_code() {
        let err = translator().translate(&ActionError::template("permission_denied", metadata(1)));
        assert_eq!(err.code, ErrorCode::PermissionDenied);
        assert_eq!(err.status, 403);
        assert_eq!(err.metadata.len(), 1);
    }

    #[test]
    fn falls_back_to_error_code_then_internal() {
        let t = translator();
        let err = t.translate(&ActionError::with_code(ErrorCode::Unavailable, "down"));
        assert_eq!((err.code, err.message.as_str()), (ErrorCode::Unavailable, "down"));

        let err = t.translate(&ActionError::new("boom"));
        assert_eq!((err.code, err.status), (ErrorCode::Internal, 500));
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn bus_errors_pass_through() {
        let original = BusError::unimplemented("Greeter::SayHello is not implemented");
        let err = translator().translate(&ActionError::from(original.clone()));
        assert_eq!(err, original);
    }
}
