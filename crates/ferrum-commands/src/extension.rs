//! Extensions: named bundles of commands, listeners and hooks that load and
//! unload as a unit.
//!
//! Everything an extension registers goes through its [`ExtensionScope`] and
//! is tagged with the extension's name, so unloading (or a failed setup) can
//! remove it again without the extension keeping track.
//!
//! # Example
//!
//! ```rust,ignore
//! struct Greetings;
//!
//! #[async_trait]
//! impl Extension for Greetings {
//!     fn name(&self) -> &str {
//!         "greetings"
//!     }
//!
//!     async fn setup(&self, scope: &mut ExtensionScope<'_>) -> Result<(), BoxError> {
//!         scope.add_command(Command::build("hello").handler(hello))?;
//!         Ok(())
//!     }
//! }
//!
//! pipeline.load_extension(Greetings).await?;
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tower::BoxError;
use tracing::{info, warn};

use ferrum_core::{ClientHandle, Event, ListenerId, Owner};

use crate::checks::Check;
use crate::context::Context;
use crate::error::{CommandError, ExtensionError, RegistrationError};
use crate::handler::{error_hook, hook};
use crate::pipeline::{HookSet, Pipeline};
use crate::registry::{Command, CommandBuilder, CommandRegistry};

#[async_trait]
pub trait Extension: Send + Sync + 'static {
    /// Unique name. Also the owner tag of everything registered in setup.
    fn name(&self) -> &str;

    async fn setup(&self, scope: &mut ExtensionScope<'_>) -> Result<(), BoxError>;

    /// Runs before the extension's registrations are removed.
    async fn teardown(&self, scope: &mut ExtensionScope<'_>) -> Result<(), BoxError> {
        let _ = scope;
        Ok(())
    }
}

/// Registration surface handed to [`Extension::setup`] and
/// [`Extension::teardown`].
pub struct ExtensionScope<'a> {
    pipeline: &'a Pipeline,
    name: Arc<str>,
}

impl<'a> ExtensionScope<'a> {
    fn new(pipeline: &'a Pipeline, name: &str) -> Self {
        Self {
            pipeline,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &ClientHandle {
        self.pipeline.handle()
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        self.pipeline.registry()
    }

    pub fn add_command(&mut self, builder: CommandBuilder) -> Result<Arc<Command>, RegistrationError> {
        self.registry().add(None, builder, Some(self.name.clone()))
    }

    /// Adds a subcommand under any existing group, including groups owned by
    /// other extensions.
    pub fn add_subcommand(
        &mut self,
        parent: &str,
        builder: CommandBuilder,
    ) -> Result<Arc<Command>, RegistrationError> {
        self.registry()
            .add(Some(parent), builder, Some(self.name.clone()))
    }

    pub fn add_listener<F, Fut>(&mut self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.handle()
            .router()
            .register_listener(event, Owner::extension(self.name.clone()), listener)
    }

    /// Adds a check for every command this extension owns.
    pub fn add_check(&mut self, check: Check) {
        self.with_hooks(|hooks| hooks.checks.push(check));
    }

    pub fn before_invoke<F, Fut>(&mut self, f: F)
    where
        F: Fn(Arc<Context>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.with_hooks(|hooks| hooks.before = Some(hook(f)));
    }

    pub fn after_invoke<F, Fut>(&mut self, f: F)
    where
        F: Fn(Arc<Context>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.with_hooks(|hooks| hooks.after = Some(hook(f)));
    }

    /// Handles errors of this extension's commands that have no hook of
    /// their own.
    pub fn on_error<F, Fut>(&mut self, f: F)
    where
        F: Fn(Arc<Context>, CommandError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.with_hooks(|hooks| hooks.on_error = Some(error_hook(f)));
    }

    fn with_hooks(&self, f: impl FnOnce(&mut HookSet)) {
        let mut all = self.pipeline.extension_hooks.write();
        f(all.entry(self.name.clone()).or_default());
    }

    /// Drops every registration tagged with this extension.
    fn remove_all(&self) -> (usize, usize) {
        let commands = self.registry().remove_extension(&self.name);
        let listeners = self
            .handle()
            .router()
            .remove_owner(&Owner::extension(self.name.clone()));
        self.pipeline.extension_hooks.write().remove(&self.name);
        (commands, listeners)
    }
}

impl Pipeline {
    /// Runs the extension's setup. If setup fails, everything it registered
    /// is removed again.
    pub async fn load_extension<E: Extension>(&self, extension: E) -> Result<(), ExtensionError> {
        self.load_shared(Arc::new(extension)).await
    }

    pub async fn load_shared(&self, extension: Arc<dyn Extension>) -> Result<(), ExtensionError> {
        let mut loaded = self.extensions.lock().await;
        let name = extension.name().to_string();
        if loaded.contains_key(&name) {
            return Err(ExtensionError::AlreadyLoaded(name));
        }

        let mut scope = ExtensionScope::new(self, &name);
        if let Err(cause) = extension.setup(&mut scope).await {
            let (commands, listeners) = scope.remove_all();
            warn!(
                extension = %name,
                error = %cause,
                commands,
                listeners,
                "Extension setup failed, registrations rolled back"
            );
            return Err(ExtensionError::SetupFailed { name, cause });
        }

        info!(extension = %name, "Extension loaded");
        loaded.insert(name, extension);
        Ok(())
    }

    /// Runs teardown, then removes everything the extension registered.
    /// A failing teardown is logged; the removal happens regardless.
    pub async fn unload_extension(&self, name: &str) -> Result<(), ExtensionError> {
        let mut loaded = self.extensions.lock().await;
        let Some(extension) = loaded.shift_remove(name) else {
            return Err(ExtensionError::NotLoaded(name.to_string()));
        };
        self.teardown(name, extension.as_ref()).await;
        Ok(())
    }

    /// Unloads and loads the same extension again.
    pub async fn reload_extension(&self, name: &str) -> Result<(), ExtensionError> {
        let extension = {
            let mut loaded = self.extensions.lock().await;
            let Some(extension) = loaded.shift_remove(name) else {
                return Err(ExtensionError::NotLoaded(name.to_string()));
            };
            self.teardown(name, extension.as_ref()).await;
            extension
        };
        self.load_shared(extension).await
    }

    /// Names of loaded extensions, in load order.
    pub async fn loaded_extensions(&self) -> Vec<String> {
        self.extensions.lock().await.keys().cloned().collect()
    }

    /// Unloads every extension, most recently loaded first.
    pub async fn unload_all(&self) {
        let mut loaded = self.extensions.lock().await;
        while let Some((name, extension)) = loaded.pop() {
            self.teardown(&name, extension.as_ref()).await;
        }
    }

    async fn teardown(&self, name: &str, extension: &dyn Extension) {
        let mut scope = ExtensionScope::new(self, name);
        if let Err(e) = extension.teardown(&mut scope).await {
            warn!(extension = %name, error = %e, "Extension teardown failed");
        }
        let (commands, listeners) = scope.remove_all();
        info!(extension = %name, commands, listeners, "Extension unloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use crate::checks::guild_only;
    use crate::pipeline::{Outcome, PipelineConfig};
    use crate::testing::{fixture, message};

    struct Games {
        fail: bool,
        teardowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Extension for Games {
        fn name(&self) -> &str {
            "games"
        }

        async fn setup(&self, scope: &mut ExtensionScope<'_>) -> Result<(), BoxError> {
            scope.add_command(
                Command::build("dice").handler(|_ctx: Arc<Context>| async { "4" }),
            )?;
            scope.add_listener("TYPING_START", |_event| async { Ok(()) });
            if self.fail {
                return Err("missing asset".into());
            }
            scope.add_command(
                Command::build("coin").handler(|_ctx: Arc<Context>| async { "heads" }),
            )?;
            Ok(())
        }

        async fn teardown(&self, _scope: &mut ExtensionScope<'_>) -> Result<(), BoxError> {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn games(fail: bool) -> (Games, Arc<AtomicUsize>) {
        let teardowns = Arc::new(AtomicUsize::new(0));
        (
            Games {
                fail,
                teardowns: teardowns.clone(),
            },
            teardowns,
        )
    }

    fn no_help() -> PipelineConfig {
        PipelineConfig {
            help: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_load_and_unload() {
        let fx = fixture();
        let pipeline = fx.pipeline(no_help());
        let (ext, teardowns) = games(false);

        pipeline.load_extension(ext).await.unwrap();
        assert_eq!(pipeline.loaded_extensions().await, ["games"]);
        assert_eq!(fx.registry.len(), 2);
        assert_eq!(fx.handle.router().listener_count("TYPING_START"), 1);
        assert_eq!(
            fx.registry.get_command("dice").unwrap().extension().map(|e| &**e),
            Some("games")
        );

        let (again, _) = games(false);
        assert!(matches!(
            pipeline.load_extension(again).await,
            Err(ExtensionError::AlreadyLoaded(name)) if name == "games"
        ));

        pipeline.unload_extension("games").await.unwrap();
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        assert!(fx.registry.is_empty());
        assert_eq!(fx.handle.router().listener_count("TYPING_START"), 0);
        assert!(matches!(
            pipeline.unload_extension("games").await,
            Err(ExtensionError::NotLoaded(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_setup_rolls_back() {
        let fx = fixture();
        let pipeline = fx.pipeline(no_help());
        let (ext, teardowns) = games(true);

        let err = pipeline.load_extension(ext).await.unwrap_err();
        assert!(matches!(err, ExtensionError::SetupFailed { ref name, .. } if name == "games"));
        assert!(err.to_string().contains("missing asset"));
        assert!(fx.registry.is_empty());
        assert_eq!(fx.handle.router().listener_count("TYPING_START"), 0);
        assert!(pipeline.loaded_extensions().await.is_empty());
        assert_eq!(teardowns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reload() {
        let fx = fixture();
        let pipeline = fx.pipeline(no_help());
        let (ext, teardowns) = games(false);
        pipeline.load_extension(ext).await.unwrap();

        pipeline.reload_extension("games").await.unwrap();
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        assert_eq!(fx.registry.len(), 2);
        assert_eq!(fx.handle.router().listener_count("TYPING_START"), 1);
    }

    struct Moderation {
        errors: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Extension for Moderation {
        fn name(&self) -> &str {
            "moderation"
        }

        async fn setup(&self, scope: &mut ExtensionScope<'_>) -> Result<(), BoxError> {
            scope.add_check(guild_only());
            let errors = self.errors.clone();
            scope.on_error(move |_ctx, err| {
                let errors = errors.clone();
                async move { errors.lock().push(err.to_string()) }
            });
            scope.add_command(Command::build("kick").handler(|_ctx: Arc<Context>| async {}))?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_extension_checks_and_error_hook() {
        let fx = fixture();
        fx.registry
            .add_command(Command::build("ping").handler(|_ctx: Arc<Context>| async { "pong" }))
            .unwrap();
        let pipeline = fx.pipeline(no_help());
        let errors = Arc::new(Mutex::new(Vec::new()));
        pipeline
            .load_extension(Moderation {
                errors: errors.clone(),
            })
            .await
            .unwrap();

        // The extension's check only guards its own commands.
        assert!(matches!(
            pipeline.process(Arc::new(message("!ping"))).await,
            Outcome::Completed { .. }
        ));
        assert!(matches!(
            pipeline.process(Arc::new(message("!kick"))).await.error(),
            Some(CommandError::CheckFailure { check }) if check == "guild_only"
        ));
        assert_eq!(*errors.lock(), ["check \"guild_only\" failed"]);

        pipeline.unload_all().await;
        assert!(pipeline.process(Arc::new(message("!kick"))).await.error().is_some());
        assert_eq!(errors.lock().len(), 1);
    }
}
