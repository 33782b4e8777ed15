//! Ambient correlation scopes.
//!
//! Every record emitted inside [`with_scope`] carries the scope's id, so
//! all output from one pipeline run (or one step) is filterable. Scopes
//! nest: an inner scope gets a fresh id and the outer id is restored when
//! its future completes.

use rand::Rng;
use rand::distr::Alphanumeric;

tokio::task_local! {
    static CORRELATION_ID: String;
}

/// A fresh human-readable correlation id: `pdk-` + 12 random
/// alphanumerics.
pub fn new_correlation_id() -> String {
    let token: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("pdk-{token}")
}

/// The ambient correlation id, if the current task is inside a scope.
pub fn current_correlation() -> Option<String> {
    CORRELATION_ID.try_with(|id| id.clone()).ok()
}

/// Run `fut` under a correlation scope with the given id.
pub async fn with_scope<F>(id: String, fut: F) -> F::Output
where
    F: std::future::Future,
{
    CORRELATION_ID.scope(id, fut).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_have_the_pdk_prefix() {
        let id = new_correlation_id();
        assert!(id.starts_with("pdk-"));
        assert_eq!(id.len(), 16);
        assert!(id[4..].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(new_correlation_id(), new_correlation_id());
    }

    #[tokio::test]
    async fn scopes_nest_and_restore() {
        assert_eq!(current_correlation(), None);

        let outer_id = new_correlation_id();
        let outer = outer_id.clone();
        with_scope(outer_id, async move {
            assert_eq!(current_correlation(), Some(outer.clone()));

            let inner = new_correlation_id();
            let inner_copy = inner.clone();
            let outer_for_inner = outer.clone();
            with_scope(inner, async move {
                let current = current_correlation().unwrap();
                assert_eq!(current, inner_copy);
                assert_ne!(current, outer_for_inner);
            })
            .await;

            // outer id restored after the inner scope ends
            assert_eq!(current_correlation(), Some(outer.clone()));
        })
        .await;

        assert_eq!(current_correlation(), None);
    }
}
