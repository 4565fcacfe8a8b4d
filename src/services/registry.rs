//! Path -> view lookup shared by the HTTP page handler and the socket router.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::live::{parse_url, Mountable};

#[derive(Default, Clone)]
pub struct ViewRegistry {
    routes: HashMap<String, Arc<dyn Mountable>>,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount `view` at `path`. A later route for the same path replaces it.
    pub fn route(mut self, path: &str, view: impl Mountable + 'static) -> Self {
        let path = normalize(path);
        debug!(path = %path, view = %view.name(), "route registered");
        self.routes.insert(path, Arc::new(view));
        self
    }

    /// Accepts a bare path or a full URL; query and fragment are ignored.
    pub fn get(&self, url: &str) -> Option<Arc<dyn Mountable>> {
        let path = parse_url(url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|| url.to_string());
        self.routes.get(&normalize(&path)).cloned()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::{LiveView, Socket};
    use crate::template::Rendered;

    fn view(name: &str) -> LiveView<(), serde_json::Value> {
        LiveView::new(name, |_: &Socket<()>| Ok(Rendered::builder().text("x").build()))
    }

    #[test]
    fn lookup_ignores_trailing_slash_and_query() {
        let registry = ViewRegistry::new()
            .route("/", view("home"))
            .route("/clock/", view("clock"));
        assert_eq!(registry.get("/").unwrap().name(), "home");
        assert_eq!(registry.get("/clock?tz=utc").unwrap().name(), "clock");
        assert_eq!(
            registry.get("http://example.com/clock/").unwrap().name(),
            "clock"
        );
        assert!(registry.get("/missing").is_none());
    }
}
