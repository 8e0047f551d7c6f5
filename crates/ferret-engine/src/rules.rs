//! The engine's view of rules.
//!
//! The rule-matching language itself lives outside the engine; what the
//! graph needs is: which files are sources, which are excluded, and which
//! job candidates could produce a given file, in priority order. The
//! [`RuleSet`] here implements a deliberately small pattern language (one
//! `%` stem per pattern) that is rich enough for the engine's own tests and
//! for simple repositories; a richer matcher plugs in by producing the same
//! [`JobProto`]s.

use ferret_proto::{Dflags, TargetSpec, Tflags};

/// One rule: patterns with at most one `%` stem, make-style.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    /// Higher priority rules are tried first; equal priorities form one
    /// tie-breaking tier.
    pub prio: i32,
    /// Target patterns; the first is the one used for matching.
    pub targets: Vec<TargetSpec>,
    /// Static dep patterns, stem-substituted.
    pub deps: Vec<String>,
    /// Command template; `{stem}` and `{target}` are substituted.
    pub cmd: String,
    pub interpreter: Vec<String>,
    /// A sure rule produces its target data-independently when run.
    pub sure: bool,
    /// Generation of the command text; bumping it makes every instantiated
    /// job stale.
    pub cmd_gen: u32,
}

/// One instantiated job candidate for a specific target.
#[derive(Debug, Clone)]
pub struct JobProto {
    pub rule_name: String,
    pub prio: i32,
    /// Full job name, unique per (rule, target).
    pub full_name: String,
    pub targets: Vec<TargetSpec>,
    pub static_deps: Vec<(String, Dflags)>,
    pub cmd: String,
    pub interpreter: Vec<String>,
    pub sure: bool,
    pub cmd_gen: u32,
}

/// Match `name` against a single-`%` pattern, returning the stem.
pub fn stem_match<'a>(pattern: &str, name: &'a str) -> Option<&'a str> {
    match pattern.find('%') {
        None => (pattern == name).then_some(""),
        Some(pos) => {
            let (prefix, suffix) = (&pattern[..pos], &pattern[pos + 1..]);
            if name.len() < prefix.len() + suffix.len() {
                return None;
            }
            if !name.starts_with(prefix) || !name.ends_with(suffix) {
                return None;
            }
            Some(&name[prefix.len()..name.len() - suffix.len()])
        }
    }
}

fn substitute(template: &str, stem: &str, target: &str) -> String {
    template.replace("{stem}", stem).replace("{target}", target)
}

/// Sources, exclusions and rules: everything `set_buildable` consults.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    /// Files listed in the manifest: always buildable, never by a job.
    pub sources: Vec<String>,
    /// Dirs whose whole content is source material.
    pub src_dirs: Vec<String>,
    /// Anti-patterns: matching files are declared non-buildable.
    pub anti: Vec<String>,
    pub rules: Vec<Rule>,
}

impl RuleSet {
    pub fn is_source(&self, name: &str) -> bool {
        self.sources.iter().any(|s| s == name)
    }

    pub fn is_src_dir(&self, name: &str) -> bool {
        self.src_dirs.iter().any(|d| d == name)
    }

    /// Is `name` inside one of the source dirs?
    pub fn under_src_dir(&self, name: &str) -> bool {
        self.src_dirs
            .iter()
            .any(|d| name.starts_with(d.as_str()) && name.as_bytes().get(d.len()) == Some(&b'/'))
    }

    pub fn is_anti(&self, name: &str) -> bool {
        self.anti.iter().any(|p| stem_match(p, name).is_some())
    }

    /// Candidate jobs for `name`, ordered by decreasing priority. Only the
    /// first matching priority tier is returned: lower tiers only become
    /// relevant after the whole tier failed to produce, and the original
    /// candidates are then re-gathered.
    pub fn job_candidates(&self, name: &str) -> Vec<JobProto> {
        let mut matching: Vec<(&Rule, &str)> = Vec::new();
        for rule in &self.rules {
            let Some(spec) = rule.targets.first() else {
                continue;
            };
            if let Some(stem) = stem_match(&spec.pattern, name) {
                matching.push((rule, stem));
            }
        }
        matching.sort_by_key(|(r, _)| std::cmp::Reverse(r.prio));
        let Some(top_prio) = matching.first().map(|(r, _)| r.prio) else {
            return Vec::new();
        };
        matching
            .into_iter()
            .take_while(|(r, _)| r.prio == top_prio)
            .map(|(rule, stem)| JobProto {
                rule_name: rule.name.clone(),
                prio: rule.prio,
                full_name: format!("{}:{}", rule.name, name),
                targets: rule
                    .targets
                    .iter()
                    .map(|t| TargetSpec {
                        pattern: if t.tflags.contains(Tflags::STAR) {
                            t.pattern.clone()
                        } else {
                            substitute(&t.pattern, stem, name)
                        },
                        tflags: t.tflags,
                    })
                    .collect(),
                static_deps: rule
                    .deps
                    .iter()
                    .map(|d| (substitute(d, stem, name), Dflags::STATIC | Dflags::REQUIRED))
                    .collect(),
                cmd: substitute(&rule.cmd, stem, name),
                interpreter: if rule.interpreter.is_empty() {
                    vec!["/bin/sh".to_string(), "-e".to_string()]
                } else {
                    rule.interpreter.clone()
                },
                sure: rule.sure,
                cmd_gen: rule.cmd_gen,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str, prio: i32, tgt: &str, deps: &[&str]) -> Rule {
        Rule {
            name: name.to_string(),
            prio,
            targets: vec![TargetSpec {
                pattern: tgt.to_string(),
                tflags: Tflags::WRITE | Tflags::CRC,
            }],
            deps: deps.iter().map(|d| d.to_string()).collect(),
            cmd: format!("make {{target}} from {}", deps.join(" ")),
            interpreter: vec![],
            sure: true,
            cmd_gen: 1,
        }
    }

    #[test]
    fn stem_matching() {
        assert_eq!(stem_match("%.o", "main.o"), Some("main"));
        assert_eq!(stem_match("obj/%.o", "obj/a.o"), Some("a"));
        assert_eq!(stem_match("%.o", "main.c"), None);
        assert_eq!(stem_match("exact", "exact"), Some(""));
        assert_eq!(stem_match("exact", "other"), None);
        assert_eq!(stem_match("%.tar.gz", "x.tar.gz"), Some("x"));
    }

    #[test]
    fn candidates_keep_only_the_top_priority_tier() {
        let rs = RuleSet {
            rules: vec![
                rule("lo", 1, "%.o", &["%.c"]),
                rule("hi-a", 5, "%.o", &["%.s"]),
                rule("hi-b", 5, "%.o", &["%.asm"]),
            ],
            ..Default::default()
        };
        let cands = rs.job_candidates("x.o");
        let names: Vec<_> = cands.iter().map(|c| c.rule_name.as_str()).collect();
        assert_eq!(names, vec!["hi-a", "hi-b"]);
    }

    #[test]
    fn stems_substitute_into_deps_and_cmd() {
        let rs = RuleSet {
            rules: vec![rule("cc", 0, "%.o", &["%.c"])],
            ..Default::default()
        };
        let cands = rs.job_candidates("src/main.o");
        assert_eq!(cands.len(), 1);
        assert_eq!(cands[0].static_deps[0].0, "src/main.c");
        assert_eq!(cands[0].full_name, "cc:src/main.o");
    }

    #[test]
    fn src_dir_containment() {
        let rs = RuleSet {
            src_dirs: vec!["vendor".to_string()],
            ..Default::default()
        };
        assert!(rs.is_src_dir("vendor"));
        assert!(rs.under_src_dir("vendor/lib.c"));
        assert!(!rs.under_src_dir("vendored/lib.c"));
    }
}
