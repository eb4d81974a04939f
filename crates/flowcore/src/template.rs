//! Response text with `{{#node.variable#}}` references.

use crate::VariablePool;
use regex::Regex;
use std::sync::LazyLock;

static REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{#([^#{}]+)#\}\}").expect("reference pattern is valid"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSegment {
    Text(String),
    /// Selector into the variable pool
    Variable(Vec<String>),
}

/// Answer text split into literal pieces and variable references, in order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseTemplate {
    pub segments: Vec<TemplateSegment>,
}

impl ResponseTemplate {
    pub fn parse(text: &str) -> Self {
        let mut segments = Vec::new();
        let mut last = 0;
        for caps in REFERENCE.captures_iter(text) {
            let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if whole.start() > last {
                segments.push(TemplateSegment::Text(text[last..whole.start()].to_string()));
            }
            let selector = inner.as_str().trim().split('.').map(str::to_string).collect();
            segments.push(TemplateSegment::Variable(selector));
            last = whole.end();
        }
        if last < text.len() {
            segments.push(TemplateSegment::Text(text[last..].to_string()));
        }
        Self { segments }
    }

    /// Selectors referenced by the template, in order
    pub fn selectors(&self) -> impl Iterator<Item = &[String]> + '_ {
        self.segments.iter().filter_map(|segment| match segment {
            TemplateSegment::Variable(selector) => Some(selector.as_slice()),
            TemplateSegment::Text(_) => None,
        })
    }

    /// Substitute every reference; missing variables render as empty text
    pub fn render(&self, pool: &VariablePool) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                TemplateSegment::Text(text) => text.clone(),
                TemplateSegment::Variable(selector) => {
                    pool.get(selector).map(|v| v.to_text()).unwrap_or_default()
                }
            })
            .collect()
    }
}
