//! Registry for namespaced protocol extensions.
//!
//! Extension methods and notifications are named `_namespace/method`; the
//! leading underscore keeps them out of the core method space, and the
//! segment before the first `/` groups them into the capability catalog
//! advertised during `initialize`.

use std::collections::{BTreeMap, HashMap};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

use crate::Error;

type ExtMethodHandler =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<Value, Error>> + Send + Sync>;
type ExtNotificationHandler =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

#[derive(Default)]
pub struct ExtensionRegistry {
    methods: Mutex<HashMap<String, ExtMethodHandler>>,
    notifications: Mutex<HashMap<String, ExtNotificationHandler>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callable extension method. The name must carry the
    /// leading `_`.
    pub fn register_method<F>(&self, name: impl Into<String>, handler: F) -> Result<(), Error>
    where
        F: Fn(Option<Value>) -> BoxFuture<'static, Result<Value, Error>> + Send + Sync + 'static,
    {
        let name = name.into();
        validate_name(&name)?;
        self.methods.lock().insert(name, Arc::new(handler));
        Ok(())
    }

    /// Registers a one-way extension notification handler.
    pub fn register_notification<F>(&self, name: impl Into<String>, handler: F) -> Result<(), Error>
    where
        F: Fn(Option<Value>) -> BoxFuture<'static, Result<(), Error>> + Send + Sync + 'static,
    {
        let name = name.into();
        validate_name(&name)?;
        self.notifications.lock().insert(name, Arc::new(handler));
        Ok(())
    }

    pub fn unregister_method(&self, name: &str) -> bool {
        self.methods.lock().remove(name).is_some()
    }

    pub fn unregister_notification(&self, name: &str) -> bool {
        self.notifications.lock().remove(name).is_some()
    }

    pub(crate) fn has_method(&self, name: &str) -> bool {
        self.methods.lock().contains_key(name)
    }

    pub(crate) fn has_notification(&self, name: &str) -> bool {
        self.notifications.lock().contains_key(name)
    }

    /// Invokes a registered extension method; unknown names produce the
    /// standard method-not-found error.
    pub fn call_method(
        &self,
        name: &str,
        params: Option<Value>,
    ) -> BoxFuture<'static, Result<Value, Error>> {
        let handler = self.methods.lock().get(name).cloned();
        match handler {
            Some(handler) => handler(params),
            None => Box::pin(async { Err(Error::method_not_found()) }),
        }
    }

    /// Invokes a registered extension notification handler. Failures are
    /// logged and swallowed: notifications are one-way.
    pub fn call_notification(
        &self,
        name: &str,
        params: Option<Value>,
    ) -> BoxFuture<'static, ()> {
        let handler = self.notifications.lock().get(name).cloned();
        let name = name.to_string();
        Box::pin(async move {
            match handler {
                Some(handler) => {
                    if let Err(err) = handler(params).await {
                        log::error!("extension notification {name} failed: {err}");
                    }
                }
                None => log::debug!("ignoring unregistered extension notification {name}"),
            }
        })
    }

    /// The advertised catalog: every namespace with at least one
    /// registered item, with its method and notification names.
    ///
    /// Shape: `{ "<namespace>": { "methods": [..], "notifications": [..] } }`,
    /// emitted inside the `initialize` response's agent-capability `_meta`.
    pub fn capabilities(&self) -> Value {
        let mut namespaces: BTreeMap<String, (Vec<String>, Vec<String>)> = BTreeMap::new();
        for name in self.methods.lock().keys() {
            namespaces
                .entry(namespace_of(name).to_string())
                .or_default()
                .0
                .push(name.clone());
        }
        for name in self.notifications.lock().keys() {
            namespaces
                .entry(namespace_of(name).to_string())
                .or_default()
                .1
                .push(name.clone());
        }

        let mut catalog = serde_json::Map::new();
        for (namespace, (mut methods, mut notifications)) in namespaces {
            methods.sort();
            notifications.sort();
            catalog.insert(
                namespace,
                serde_json::json!({
                    "methods": methods,
                    "notifications": notifications,
                }),
            );
        }
        Value::Object(catalog)
    }

    pub fn is_empty(&self) -> bool {
        self.methods.lock().is_empty() && self.notifications.lock().is_empty()
    }
}

fn validate_name(name: &str) -> Result<(), Error> {
    if !name.starts_with('_') || name.len() < 2 {
        return Err(Error::invalid_params()
            .with_data(format!("extension names must start with '_': {name}")));
    }
    Ok(())
}

/// `_myapp/action` → `myapp`; names without a `/` form their own namespace.
fn namespace_of(name: &str) -> &str {
    let stripped = &name[1..];
    stripped.split('/').next().unwrap_or(stripped)
}
