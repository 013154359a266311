//! Live actor registry
//!
//! Owns one in-memory instance per actor name behind a per-name async
//! mutex. Every load-mutate-save cycle and every outbox append for a name
//! runs under that name's lock, so concurrent requests against the same
//! actor cannot lose each other's updates. Mutations are applied to a copy
//! and only published once the copy has been written to disk.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;

use super::models::Actor;
use super::store::{ActivityStore, validate_identifier};
use crate::error::AppError;

type Slot = Arc<AsyncMutex<Option<Actor>>>;

pub struct ActorRegistry {
    store: Arc<ActivityStore>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ActorRegistry {
    pub fn new(store: Arc<ActivityStore>) -> Self {
        Self {
            store,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &ActivityStore {
        &self.store
    }

    fn slot(&self, name: &str) -> Result<Slot, AppError> {
        validate_identifier(name)?;
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(slots.entry(name.to_string()).or_default().clone())
    }

    async fn loaded<'a>(
        &self,
        name: &str,
        slot: &'a mut Option<Actor>,
    ) -> Result<&'a mut Actor, AppError> {
        if slot.is_none() {
            *slot = Some(self.store.load(name).await?);
        }
        slot.as_mut()
            .ok_or_else(|| AppError::NotFound(format!("actor {}", name)))
    }

    /// Forget the slot for `name` when no actor was loaded into it and no
    /// other task holds it, so lookups of unknown names leave nothing behind.
    fn release_if_vacant(&self, name: &str, slot: &Slot) {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // One reference in the map and one held by the caller
        if Arc::strong_count(slot) != 2 {
            return;
        }
        if slot.try_lock().is_ok_and(|guard| guard.is_none()) {
            slots.remove(name);
        }
    }

    /// Snapshot of the current actor state.
    pub async fn get(&self, name: &str) -> Result<Actor, AppError> {
        let slot = self.slot(name)?;
        let result = {
            let mut guard = slot.lock().await;
            self.loaded(name, &mut guard).await.map(|actor| actor.clone())
        };
        if result.is_err() {
            self.release_if_vacant(name, &slot);
        }
        result
    }

    /// Load `name`, or build it with `create` and persist it if absent.
    ///
    /// Returns the actor and whether it was newly created.
    pub async fn get_or_create<F, Fut>(&self, name: &str, create: F) -> Result<(Actor, bool), AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Actor, AppError>>,
    {
        let slot = self.slot(name)?;
        let result: Result<(Actor, bool), AppError> = async {
            let mut guard = slot.lock().await;

            match self.loaded(name, &mut guard).await {
                Ok(actor) => return Ok((actor.clone(), false)),
                Err(AppError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }

            let actor = create().await?;
            if actor.name != name {
                return Err(AppError::Internal(anyhow::anyhow!(
                    "created actor {} under name {}",
                    actor.name,
                    name
                )));
            }
            self.store.save(&actor).await?;
            *guard = Some(actor.clone());

            tracing::info!(actor = %name, iri = %actor.iri, "Created actor");
            Ok((actor, true))
        }
        .await;
        if result.is_err() {
            self.release_if_vacant(name, &slot);
        }
        result
    }

    /// Apply `mutate` under the actor's lock and persist the result.
    ///
    /// If `mutate` fails or the save fails, the live state is unchanged.
    pub async fn update<T, F>(&self, name: &str, mutate: F) -> Result<T, AppError>
    where
        F: FnOnce(&mut Actor) -> Result<T, AppError>,
    {
        let slot = self.slot(name)?;
        let result: Result<T, AppError> = async {
            let mut guard = slot.lock().await;
            let live = self.loaded(name, &mut guard).await?;

            let mut draft = live.clone();
            let value = mutate(&mut draft)?;
            self.store.save(&draft).await?;
            *live = draft;

            Ok(value)
        }
        .await;
        if result.is_err() {
            self.release_if_vacant(name, &slot);
        }
        result
    }

    /// Append to the actor's outbox under its lock.
    pub async fn append_outbox(&self, name: &str, iri: &str) -> Result<(), AppError> {
        let slot = self.slot(name)?;
        let result = async {
            let mut guard = slot.lock().await;
            self.loaded(name, &mut guard).await?;
            self.store.append_outbox(name, iri).await
        }
        .await;
        if result.is_err() {
            self.release_if_vacant(name, &slot);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::keys::tests::test_keyring;
    use tempfile::TempDir;

    async fn registry() -> (TempDir, Arc<ActorRegistry>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ActivityStore::open(dir.path()).await.unwrap());
        (dir, Arc::new(ActorRegistry::new(store)))
    }

    fn alice() -> Actor {
        Actor::new(
            "alice",
            "https://social.example/alice",
            "",
            "Person",
            test_keyring(),
        )
    }

    #[tokio::test]
    async fn get_or_create_creates_once() {
        let (_dir, registry) = registry().await;

        let (_, created) = registry
            .get_or_create("alice", || async { Ok(alice()) })
            .await
            .unwrap();
        assert!(created);

        let (_, created) = registry
            .get_or_create("alice", || async {
                Err(AppError::Validation("must not create twice".into()))
            })
            .await
            .unwrap();
        assert!(!created);
        assert!(registry.store().exists("alice").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_updates_are_not_lost() {
        let (_dir, registry) = registry().await;
        registry
            .get_or_create("alice", || async { Ok(alice()) })
            .await
            .unwrap();

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .update("alice", |actor| {
                            let remote = format!("https://peer/{}", i);
                            actor.add_follower(&remote, &format!("{}/inbox", remote), None);
                            Ok(())
                        })
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(registry.get("alice").await.unwrap().followers().len(), 20);
        assert_eq!(
            registry.store().load("alice").await.unwrap().followers().len(),
            20
        );
    }

    #[tokio::test]
    async fn failed_mutation_leaves_state_untouched() {
        let (_dir, registry) = registry().await;
        registry
            .get_or_create("alice", || async { Ok(alice()) })
            .await
            .unwrap();

        let result: Result<(), AppError> = registry
            .update("alice", |actor| {
                actor.mark_requested("https://peer/bob", "h1");
                Err(AppError::Validation("nope".into()))
            })
            .await;

        assert!(result.is_err());
        assert!(registry.get("alice").await.unwrap().requested().is_empty());
    }

    #[tokio::test]
    async fn unknown_actor_is_not_found() {
        let (_dir, registry) = registry().await;
        assert!(matches!(
            registry.get("nobody").await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            registry.update("nobody", |_| Ok(())).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            registry.get("no body").await,
            Err(AppError::IllegalIdentifier(_))
        ));
    }

    fn slot_count(registry: &ActorRegistry) -> usize {
        registry.slots.lock().unwrap().len()
    }

    #[tokio::test]
    async fn lookups_of_unknown_names_leave_no_slots() {
        let (_dir, registry) = registry().await;
        registry
            .get_or_create("alice", || async { Ok(alice()) })
            .await
            .unwrap();

        for i in 0..1000 {
            let name = format!("ghost{}", i);
            assert!(registry.get(&name).await.is_err());
            assert!(registry.update(&name, |_| Ok(())).await.is_err());
            assert!(registry.append_outbox(&name, "https://x/1").await.is_err());
        }
        let failed = registry
            .get_or_create("ghost", || async {
                Err(AppError::Validation("no keys".into()))
            })
            .await;
        assert!(failed.is_err());

        assert_eq!(slot_count(&registry), 1);
        assert!(registry.get("alice").await.is_ok());
    }

    #[tokio::test]
    async fn failed_mutation_keeps_loaded_slot() {
        let (_dir, registry) = registry().await;
        registry
            .get_or_create("alice", || async { Ok(alice()) })
            .await
            .unwrap();

        let result: Result<(), AppError> = registry
            .update("alice", |_| Err(AppError::Validation("nope".into())))
            .await;
        assert!(result.is_err());
        assert_eq!(slot_count(&registry), 1);
    }
}
