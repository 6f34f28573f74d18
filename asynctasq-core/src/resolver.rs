//! Rehydrates [reference envelope](crate::value::Value::reference) argument
//! values before a handler executes.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use thiserror::Error;

use crate::value::Value;

/// A type-registered loader: given a primary key, fetches the current
/// record and returns it as a [`Value`] (typically a `Value::Map`).
#[async_trait]
pub trait RefLoader: Send + Sync {
    async fn load(&self, primary_key: &Value) -> Result<Value, ResolveError>;
}

#[derive(Debug, Error)]
#[error("failed to resolve reference to {class_path}: {message}")]
pub struct ResolveError {
    pub class_path: String,
    pub message: String,
}

/// Holds one [`RefLoader`] per `class_path` and walks an argument tree,
/// substituting every `REF` value it finds with its materialized record.
#[derive(Clone, Default)]
pub struct Resolver {
    loaders: BTreeMap<String, Arc<dyn RefLoader>>,
}

impl Resolver {
    pub fn new() -> Self {
        Resolver {
            loaders: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, class_path: impl Into<String>, loader: Arc<dyn RefLoader>) {
        self.loaders.insert(class_path.into(), loader);
    }

    /// Resolves every `REF` value reachable from `args`, loading them all
    /// concurrently. Returns a new argument map with references replaced
    /// by their materialized value.
    pub async fn resolve_args(
        &self,
        args: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>, ResolveError> {
        let futures = args
            .iter()
            .map(|(key, value)| async move { Ok((key.clone(), self.resolve_value(value).await?)) });
        let resolved = try_join_all(futures).await?;
        Ok(resolved.into_iter().collect())
    }

    fn resolve_value<'a>(
        &'a self,
        value: &'a Value,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, ResolveError>> + Send + 'a>>
    {
        Box::pin(async move {
            if let Some((class_path, primary_key)) = value.as_reference() {
                let loader =
                    self.loaders
                        .get(class_path)
                        .cloned()
                        .ok_or_else(|| ResolveError {
                            class_path: class_path.to_string(),
                            message: "no loader registered for this class path".to_string(),
                        })?;
                return loader.load(primary_key).await;
            }

            match value {
                Value::Seq(items) => {
                    let resolved = try_join_all(items.iter().map(|v| self.resolve_value(v))).await?;
                    Ok(Value::Seq(resolved))
                }
                Value::Set(items) => {
                    let resolved = try_join_all(items.iter().map(|v| self.resolve_value(v))).await?;
                    Ok(Value::Set(resolved))
                }
                Value::Map(map) => {
                    let futures = map.iter().map(|(k, v)| async move {
                        Ok::<_, ResolveError>((k.clone(), self.resolve_value(v).await?))
                    });
                    let resolved = try_join_all(futures).await?;
                    Ok(Value::Map(resolved.into_iter().collect()))
                }
                other => Ok(other.clone()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UserLoader;

    #[async_trait]
    impl RefLoader for UserLoader {
        async fn load(&self, primary_key: &Value) -> Result<Value, ResolveError> {
            let mut record = BTreeMap::new();
            record.insert("id".to_string(), primary_key.clone());
            record.insert("email".to_string(), Value::Str("a@b".to_string()));
            Ok(Value::Map(record))
        }
    }

    struct FailingLoader;

    #[async_trait]
    impl RefLoader for FailingLoader {
        async fn load(&self, _primary_key: &Value) -> Result<Value, ResolveError> {
            Err(ResolveError {
                class_path: "Broken".to_string(),
                message: "boom".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn resolves_a_top_level_reference() {
        let mut resolver = Resolver::new();
        resolver.register("User", Arc::new(UserLoader));

        let mut args = BTreeMap::new();
        args.insert("user".to_string(), Value::reference("User", Value::Int(42)));

        let resolved = resolver.resolve_args(&args).await.unwrap();
        let user = resolved.get("user").unwrap().as_map().unwrap();
        assert_eq!(user.get("id"), Some(&Value::Int(42)));
    }

    #[tokio::test]
    async fn resolves_references_nested_inside_sequences() {
        let mut resolver = Resolver::new();
        resolver.register("User", Arc::new(UserLoader));

        let mut args = BTreeMap::new();
        args.insert(
            "users".to_string(),
            Value::Seq(vec![Value::reference("User", Value::Int(1))]),
        );

        let resolved = resolver.resolve_args(&args).await.unwrap();
        let Value::Seq(items) = resolved.get("users").unwrap() else {
            panic!("expected seq");
        };
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn loader_failure_surfaces_as_resolve_error() {
        let mut resolver = Resolver::new();
        resolver.register("Broken", Arc::new(FailingLoader));

        let mut args = BTreeMap::new();
        args.insert("x".to_string(), Value::reference("Broken", Value::Int(1)));

        let err = resolver.resolve_args(&args).await.unwrap_err();
        assert_eq!(err.class_path, "Broken");
    }

    #[tokio::test]
    async fn unregistered_class_path_is_a_resolve_error() {
        let resolver = Resolver::new();
        let mut args = BTreeMap::new();
        args.insert("x".to_string(), Value::reference("Missing", Value::Int(1)));
        let err = resolver.resolve_args(&args).await.unwrap_err();
        assert_eq!(err.class_path, "Missing");
    }
}
