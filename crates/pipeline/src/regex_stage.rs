//! Regex rewrite stages.

use loomweave_assets::{RegexPlacement, RegexRule, RuleMode};
use loomweave_core::View;
use loomweave_variables::VariableState;
use regex_lite::Regex;
use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::condition::{Condition, EvalContext, parse_condition};
use crate::stage::SourcedContent;

struct CompiledRule {
    rule: RegexRule,
    regex: Regex,
    condition: Option<Condition>,
}

impl CompiledRule {
    fn applies_to(&self, item: &SourcedContent, view: View) -> bool {
        (self.rule.targets.is_empty() || self.rule.targets.iter().any(|t| t == item.source.kind()))
            && (self.rule.views.is_empty() || self.rule.views.contains(&view))
    }
}

/// The merged rules of one build, compiled once.
pub struct RegexEngine {
    rules: Vec<CompiledRule>,
    /// Indices of rules that matched at least once
    applied: BTreeSet<usize>,
}

/// Turn `flags` into an inline group prefix. `g` is ignored.
fn pattern_with_flags(find: &str, flags: &str) -> String {
    let mut inline: Vec<char> = flags.chars().filter(|c| "imsx".contains(*c)).collect();
    inline.sort_unstable();
    inline.dedup();
    if inline.is_empty() {
        find.to_string()
    } else {
        format!("(?{}){find}", inline.into_iter().collect::<String>())
    }
}

impl RegexEngine {
    /// Compile enabled rules. Rules with an invalid pattern or condition are
    /// logged and left out.
    pub fn compile(rules: &[RegexRule]) -> Self {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules.iter().filter(|r| r.enabled) {
            let regex = match Regex::new(&pattern_with_flags(&rule.find, &rule.flags)) {
                Ok(re) => re,
                Err(e) => {
                    warn!(rule = %rule.name, find = %rule.find, error = %e, "Skipping regex rule with invalid pattern");
                    continue;
                }
            };
            let condition = match rule.mode {
                RuleMode::Always => None,
                RuleMode::Conditional => {
                    match parse_condition(rule.condition.as_deref().unwrap_or_default()) {
                        Ok(cond) => Some(cond),
                        Err(e) => {
                            warn!(rule = %rule.name, error = %e, "Skipping regex rule with unparseable condition");
                            continue;
                        }
                    }
                }
            };
            compiled.push(CompiledRule {
                rule: rule.clone(),
                regex,
                condition,
            });
        }
        Self {
            rules: compiled,
            applied: BTreeSet::new(),
        }
    }

    /// Run every rule with `placement` over `items`, in rule order.
    pub fn apply(
        &mut self,
        placement: RegexPlacement,
        items: &mut [SourcedContent],
        view: View,
        variables: &VariableState,
    ) {
        for (index, compiled) in self.rules.iter().enumerate() {
            if compiled.rule.placement != placement {
                continue;
            }
            for item in items.iter_mut() {
                if !compiled.applies_to(item, view) {
                    continue;
                }
                if let Some(condition) = &compiled.condition {
                    let ctx = EvalContext {
                        variables,
                        text: &item.text,
                        view,
                    };
                    if !condition.evaluate(&ctx) {
                        continue;
                    }
                }
                if !compiled.regex.is_match(&item.text) {
                    continue;
                }
                let replaced = compiled
                    .regex
                    .replace_all(&item.text, compiled.rule.replace.as_str())
                    .into_owned();
                debug!(rule = %compiled.rule.name, tag = %item.tag, "Regex rule applied");
                item.text = replaced;
                self.applied.insert(index);
            }
        }
    }

    /// Rules that changed something, in merged order.
    pub fn applied_rules(&self) -> Vec<RegexRule> {
        self.applied
            .iter()
            .filter_map(|&i| self.rules.get(i))
            .map(|c| c.rule.clone())
            .collect()
    }
}
