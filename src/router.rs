//! Radix-tree request router.
//!
//! One tree per HTTP method. O(path-length) lookup. The router only answers
//! "which chain serves this request?"; running the chain is the engine's job.

use std::collections::HashMap;

use http::Method;
use matchit::Router as MatchitRouter;

use crate::handler::HandlersChain;

/// Outcome of routing one request.
pub enum Lookup {
    /// A route matched: its chain and the extracted path parameters.
    Found(HandlersChain, Vec<(String, String)>),
    /// No tree knows the path.
    NoRoute,
    /// The path exists, but only under other methods.
    NoMethod,
}

/// Method + path → handler chain table.
#[derive(Default)]
pub struct Router {
    routes: HashMap<Method, MatchitRouter<HandlersChain>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a chain for a method + path pair.
    ///
    /// Path parameters use `{name}` syntax.
    ///
    /// # Panics
    ///
    /// Panics if the path is invalid or conflicts with an existing route.
    /// Routes are registered once at startup, before serving.
    pub fn add(&mut self, method: Method, path: &str, chain: HandlersChain) {
        self.routes
            .entry(method)
            .or_default()
            .insert(path, chain)
            .unwrap_or_else(|e| panic!("invalid route `{path}`: {e}"));
    }

    pub fn lookup(&self, method: &Method, path: &str) -> Lookup {
        if let Some(matched) = self.routes.get(method).and_then(|tree| tree.at(path).ok()) {
            let params = matched.params.iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect();
            return Lookup::Found(HandlersChain::clone(matched.value), params);
        }

        let elsewhere = self.routes.iter()
            .any(|(m, tree)| m != method && tree.at(path).is_ok());
        if elsewhere { Lookup::NoMethod } else { Lookup::NoRoute }
    }
}

/// Joins a group prefix and a relative path into one absolute path.
pub(crate) fn join_paths(prefix: &str, relative: &str) -> String {
    if relative.is_empty() {
        return prefix.to_owned();
    }
    let joined = format!(
        "{}/{}",
        prefix.trim_end_matches('/'),
        relative.trim_start_matches('/')
    );
    if relative.ends_with('/') && !joined.ends_with('/') {
        joined + "/"
    } else {
        joined
    }
}
