use std::collections::BTreeMap;

use crate::error::TemplateError;

/// Variables available to rename templates
pub const VARIABLES: &[&str] = &[
    "date",
    "title_episode",
    "title_sub",
    "title_feed",
    "author_feed",
    "author_entry",
    "guid",
    "uuid",
    "basename",
    "extension",
    "filename",
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Variable(String),
}

/// A parsed `{variable}` rename template
///
/// `{{` and `}}` produce literal braces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameTemplate {
    parts: Vec<Part>,
}

impl RenameTemplate {
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => name.push(c),
                            None => {
                                return Err(TemplateError::Unclosed {
                                    template: template.to_string(),
                                });
                            }
                        }
                    }
                    let name = name.trim().to_string();
                    if !VARIABLES.contains(&name.as_str()) {
                        return Err(TemplateError::UnknownVariable { name });
                    }
                    if !literal.is_empty() {
                        parts.push(Part::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(Part::Variable(name));
                }
                c => literal.push(c),
            }
        }

        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }

        Ok(Self { parts })
    }

    /// Substitute variables; missing values render as empty strings
    pub fn render(&self, variables: &BTreeMap<String, String>) -> String {
        self.parts
            .iter()
            .map(|part| match part {
                Part::Literal(text) => text.as_str(),
                Part::Variable(name) => variables.get(name).map(String::as_str).unwrap_or(""),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn renders_variables_and_literals() {
        let template = RenameTemplate::parse("{date} - {title_episode}").unwrap();
        let rendered = template.render(&vars(&[("date", "2024-01-15"), ("title_episode", "Hello")]));

        assert_eq!(rendered, "2024-01-15 - Hello");
    }

    #[test]
    fn doubled_braces_are_literal() {
        let template = RenameTemplate::parse("{{{guid}}}").unwrap();
        assert_eq!(template.render(&vars(&[("guid", "x")])), "{x}");
    }

    #[test]
    fn unknown_variable_is_rejected() {
        assert_eq!(
            RenameTemplate::parse("{episode_number}"),
            Err(TemplateError::UnknownVariable {
                name: "episode_number".to_string()
            })
        );
    }

    #[test]
    fn unclosed_placeholder_is_rejected() {
        assert!(matches!(
            RenameTemplate::parse("{title_episode"),
            Err(TemplateError::Unclosed { .. })
        ));
    }

    #[test]
    fn missing_values_render_empty() {
        let template = RenameTemplate::parse("{author_entry}-{guid}").unwrap();
        assert_eq!(template.render(&vars(&[("guid", "g")])), "-g");
    }
}
