//! Wire-neutral router command representation.
//!
//! A [`RouterCommand`] names a RouterOS menu path plus property arguments and
//! an optional query. Each transport renders it in its own wire format: the
//! SSH transport as a CLI line, the REST transport as `POST /rest/<path>`
//! with a JSON body. Keeping the command symbolic is what lets failover swap
//! transports mid-flight without the backend noticing.

use serde_json::{Map, Value, json};

/// One router operation, transport-agnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterCommand {
    path: Vec<String>,
    args: Vec<(String, String)>,
    flags: Vec<String>,
    query: Vec<(String, String)>,
}

impl RouterCommand {
    /// Build from a slash path, e.g. `"queue/simple/set"`.
    pub fn new(path: &str) -> Self {
        Self {
            path: path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            args: Vec::new(),
            flags: Vec::new(),
            query: Vec::new(),
        }
    }

    /// Add a `key=value` property argument.
    pub fn arg(mut self, key: &str, value: impl ToString) -> Self {
        self.args.push((key.to_string(), value.to_string()));
        self
    }

    /// Add a bare flag argument (e.g. `stats`).
    pub fn flag(mut self, flag: &str) -> Self {
        self.flags.push(flag.to_string());
        self
    }

    /// Add a `where key=value` selection clause.
    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    /// Menu path joined for REST (`queue/simple/set`).
    pub fn rest_path(&self) -> String {
        self.path.join("/")
    }

    /// JSON body for the REST transport.
    ///
    /// Query clauses become RouterOS `.query` entries; flags become
    /// `"flag": "yes"` properties.
    pub fn rest_body(&self) -> Value {
        let mut body = Map::new();
        for (k, v) in &self.args {
            body.insert(k.clone(), json!(v));
        }
        for f in &self.flags {
            body.insert(f.clone(), json!("yes"));
        }
        if !self.query.is_empty() {
            let q: Vec<Value> = self.query.iter().map(|(k, v)| json!(format!("{k}={v}"))).collect();
            body.insert(".query".to_string(), Value::Array(q));
        }
        Value::Object(body)
    }

    /// CLI line for the SSH transport.
    ///
    /// Values containing whitespace are double-quoted; the identifier rules
    /// enforced at config load keep quoting trivial.
    pub fn cli_render(&self) -> String {
        let mut out = format!("/{}", self.path.join("/"));
        for f in &self.flags {
            out.push(' ');
            out.push_str(f);
        }
        for (k, v) in &self.args {
            out.push(' ');
            out.push_str(k);
            out.push('=');
            out.push_str(&quote_cli(v));
        }
        if !self.query.is_empty() {
            out.push_str(" where");
            for (k, v) in &self.query {
                out.push(' ');
                out.push_str(k);
                out.push('=');
                out.push_str(&quote_cli(v));
            }
        }
        out
    }

    /// Short description for logs (`queue/simple/set`).
    pub fn describe(&self) -> String {
        self.path.join("/")
    }
}

fn quote_cli(value: &str) -> String {
    if value.chars().any(|c| c.is_whitespace()) {
        format!("\"{value}\"")
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_render_set_queue() {
        let cmd = RouterCommand::new("queue/simple/set")
            .arg("numbers", "wan1-down")
            .arg("max-limit", 800_000_000u64);
        assert_eq!(
            cmd.cli_render(),
            "/queue/simple/set numbers=wan1-down max-limit=800000000"
        );
    }

    #[test]
    fn cli_render_print_with_query_and_flag() {
        let cmd = RouterCommand::new("queue/simple/print")
            .flag("stats")
            .query("name", "wan1-down");
        assert_eq!(
            cmd.cli_render(),
            "/queue/simple/print stats where name=wan1-down"
        );
    }

    #[test]
    fn cli_quotes_whitespace_values() {
        let cmd = RouterCommand::new("ip/firewall/mangle/print").query("comment", "ADAPTIVE STEER");
        assert!(cmd.cli_render().ends_with("comment=\"ADAPTIVE STEER\""));
    }

    #[test]
    fn rest_body_contains_args_flags_and_query() {
        let cmd = RouterCommand::new("queue/simple/print")
            .flag("stats")
            .query("name", "wan1-down");
        assert_eq!(cmd.rest_path(), "queue/simple/print");
        let body = cmd.rest_body();
        assert_eq!(body["stats"], "yes");
        assert_eq!(body[".query"][0], "name=wan1-down");
    }

    #[test]
    fn leading_slash_in_path_is_tolerated() {
        let cmd = RouterCommand::new("/queue/simple/set");
        assert_eq!(cmd.rest_path(), "queue/simple/set");
        assert_eq!(cmd.cli_render(), "/queue/simple/set");
    }
}
