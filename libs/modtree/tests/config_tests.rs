//! Reconfiguration, the configuration service and its backend event pump.

mod common;

use common::{bring_up, probe, tear_down, Fixture};
use modtree::config::dispatch_event;
use modtree::{
    error_chain, ConfigBackend, ConfigEvent, ConfigurationService, MemoryConfigBackend, Module,
    ModuleError, ModuleKind, Phase, CONFIGURATION_SERVICE,
};
use runtime::ModuleSettings;
use serde_json::json;
use std::sync::Arc;

/// Root with a live configuration service, `Foo` seeded with `{"a": 1}` and `Bar`
/// depending on `Foo`.
fn served_fixture() -> (Fixture, Arc<MemoryConfigBackend>) {
    let backend = Arc::new(MemoryConfigBackend::new());
    backend.insert(
        "services/Foo",
        ModuleSettings {
            enabled: true,
            config: json!({"a": 1}),
        },
    );

    let mut fx = Fixture::new();
    let served: Arc<dyn ConfigBackend> = backend.clone();
    fx.register_with(ModuleKind::Service, CONFIGURATION_SERVICE, move || {
        Arc::new(ConfigurationService::new(served.clone())) as Arc<dyn Module>
    });
    fx.marker("services/Configuration", ModuleKind::Service, "");
    fx.unit("services/Foo", probe(ModuleKind::Service, "Foo"), "")
        .unit(
            "services/Bar",
            probe(ModuleKind::Service, "Bar").deps(&["Foo"]),
            "",
        );
    (fx, backend)
}

#[tokio::test]
async fn backend_update_reconfigures_the_addressed_unit() {
    let (mut fx, backend) = served_fixture();
    let root = fx.root();
    bring_up(&root).await;

    let foo = root.find("services/Foo").unwrap();
    assert_eq!(*foo.config(), json!({"a": 1}));
    let service = root.find("services/Configuration").unwrap();
    assert!(service
        .module_as::<ConfigurationService>()
        .unwrap()
        .is_pumping());

    backend.publish_config("services/Foo", json!({"b": {"c": 2}}));
    fx.wait_for("Bar:dependencyReconfigure(Foo)").await;
    assert_eq!(*foo.config(), json!({"a": 1, "b": {"c": 2}}));

    tear_down(&root).await;
    assert!(!service
        .module_as::<ConfigurationService>()
        .unwrap()
        .is_pumping());
}

#[tokio::test]
async fn backend_deletion_clears_the_configuration() {
    let (mut fx, backend) = served_fixture();
    let root = fx.root();
    bring_up(&root).await;

    backend.remove_config("services/Foo");
    fx.wait_for("Bar:dependencyReconfigure(Foo)").await;
    assert_eq!(*root.find("services/Foo").unwrap().config(), json!({}));
    tear_down(&root).await;
}

#[tokio::test]
async fn backend_state_update_toggles_the_unit() {
    let (mut fx, backend) = served_fixture();
    let root = fx.root();
    bring_up(&root).await;
    let foo = root.find("services/Foo").unwrap();

    backend.publish_state("services/Foo", false);
    fx.wait_for("Bar:stop").await;
    assert!(!foo.is_enabled());
    assert_eq!(foo.phase(), Phase::Stopped);
    assert!(!root.find("services/Bar").unwrap().is_enabled());

    fx.clear();
    foo.set_enabled(true).await.unwrap();
    fx.wait_for("Bar:start").await;
    assert!(fx.position("Foo:start") < fx.position("Bar:dependencyStateChange(Foo,true)"));
    assert!(foo.stored_state().await.unwrap());
    assert!(foo.is_enabled());
    tear_down(&root).await;
}

#[tokio::test]
async fn saved_configuration_comes_back_as_a_reconfigure() {
    let (mut fx, backend) = served_fixture();
    let root = fx.root();
    bring_up(&root).await;
    let foo = root.find("services/Foo").unwrap();

    foo.save_config(&json!({"c": 3})).await.unwrap();
    fx.wait_for("Bar:dependencyReconfigure(Foo)").await;
    assert_eq!(*foo.config(), json!({"a": 1, "c": 3}));
    assert_eq!(
        backend.settings("services/Foo").unwrap().config,
        json!({"a": 1, "c": 3})
    );
    tear_down(&root).await;
}

#[tokio::test]
async fn events_for_unknown_paths_are_dropped() {
    let (mut fx, backend) = served_fixture();
    let root = fx.root();
    bring_up(&root).await;

    dispatch_event(
        &root,
        ConfigEvent::UpdateConfig {
            path: "services/Ghost".into(),
            configuration: json!({"x": 1}),
        },
    )
    .await
    .unwrap();

    // The pump survives them too.
    backend.publish_config("services/Ghost", json!({"x": 1}));
    backend.publish_config("services/Foo", json!({"d": 4}));
    fx.wait_for("Bar:dependencyReconfigure(Foo)").await;
    tear_down(&root).await;
}

#[tokio::test]
async fn nested_configuration_service_does_not_pump() {
    let (mut fx, _backend) = served_fixture();
    fx.unit(
        "services/Shop",
        probe(ModuleKind::Service, "Shop"),
        "config:\n  paths:\n    services: services\n",
    );
    fx.marker("services/Shop/services/Configuration", ModuleKind::Service, "");
    let root = fx.root();
    bring_up(&root).await;

    let nested = root.find("services/Shop/services/Configuration").unwrap();
    assert_eq!(nested.phase(), Phase::Started);
    assert!(!nested
        .module_as::<ConfigurationService>()
        .unwrap()
        .is_pumping());
    tear_down(&root).await;
    assert_eq!(nested.phase(), Phase::Unloaded);
}

#[tokio::test]
async fn configuration_service_bootstraps_before_other_loads() {
    let mut fx = Fixture::new();
    fx.unit(
        "services/Configuration",
        probe(ModuleKind::Service, CONFIGURATION_SERVICE),
        "",
    )
    .unit("services/Foo", probe(ModuleKind::Service, "Foo"), "")
    .unit("utilities/Clock", probe(ModuleKind::Utility, "Clock"), "");
    let root = fx.root();

    root.load(None).await.unwrap();
    assert_eq!(
        fx.events()[..4],
        [
            "Configuration:load",
            "Configuration:initialize",
            "Configuration:start",
            "Clock:load"
        ]
    );
    let service = root.find("services/Configuration").unwrap();
    assert_eq!(service.phase(), Phase::Started);

    // The bootstrap outcome is replayed, never re-run.
    root.initialize().await.unwrap();
    root.start().await.unwrap();
    assert_eq!(fx.count("Configuration:initialize"), 1);
    assert_eq!(fx.count("Configuration:start"), 1);
    assert_eq!(fx.count("Foo:start"), 1);

    tear_down(&root).await;
    assert_eq!(fx.count("Configuration:stop"), 1);
    assert_eq!(fx.count("Configuration:unload"), 1);
}

#[tokio::test]
async fn unloading_right_after_load_walks_the_service_down() {
    let mut fx = Fixture::new();
    fx.unit(
        "services/Configuration",
        probe(ModuleKind::Service, CONFIGURATION_SERVICE),
        "",
    );
    let root = fx.root();

    root.load(None).await.unwrap();
    root.unload().await.unwrap();
    assert_eq!(
        fx.events()[3..],
        [
            "Configuration:stop",
            "Configuration:uninitialize",
            "Configuration:unload"
        ]
    );
}

#[tokio::test]
async fn configuration_service_load_failure_is_fatal() {
    let mut fx = Fixture::new();
    fx.unit(
        "services/Configuration",
        probe(ModuleKind::Service, CONFIGURATION_SERVICE).failing("load"),
        "",
    )
    .unit("services/Foo", probe(ModuleKind::Service, "Foo"), "");
    let root = fx.root();

    let err = root.load(None).await.unwrap_err();
    assert!(matches!(err, ModuleError::LoaderLoad { .. }));
    assert!(!err.is_partial());
    assert_eq!(
        error_chain(&err),
        "Application::load: failed to load sub-modules: \
         configuration service 'Configuration' failed to come up: \
         Configuration::load: module callback failed: Configuration refused load"
    );
    assert_eq!(root.phase(), Phase::Unloaded);
    assert!(!root.loader().is_loaded());
    assert_eq!(fx.count("Foo:load"), 0);
}

#[tokio::test]
async fn reconfigure_with_no_change_notifies_nobody() {
    let mut fx = Fixture::new();
    fx.unit(
        "services/Foo",
        probe(ModuleKind::Service, "Foo"),
        "config:\n  a: 1\n",
    )
    .unit(
        "services/Bar",
        probe(ModuleKind::Service, "Bar").deps(&["Foo"]),
        "",
    );
    let root = fx.root();
    bring_up(&root).await;
    let foo = root.find("services/Foo").unwrap();
    fx.clear();

    foo.reconfigure(json!({"a": 1})).await.unwrap();
    foo.reconfigure(json!({})).await.unwrap();
    assert!(fx.events().is_empty());
    tear_down(&root).await;
}

#[tokio::test]
async fn reconfigure_reaches_parent_then_children_then_dependants() {
    let mut fx = Fixture::new();
    fx.unit(
        "services/Foo",
        probe(ModuleKind::Service, "Foo"),
        "config:\n  paths:\n    utilities: utilities\n",
    )
    .unit(
        "services/Foo/utilities/Clock",
        probe(ModuleKind::Utility, "Clock"),
        "",
    )
    .unit(
        "services/Bar",
        probe(ModuleKind::Service, "Bar").deps(&["Foo"]),
        "",
    );
    let root = fx.probe_root("App");
    bring_up(&root).await;
    let foo = root.find("services/Foo").unwrap();
    fx.clear();

    foo.reconfigure(json!({"tz": "UTC"})).await.unwrap();
    assert_eq!(
        fx.events(),
        vec![
            "App:subModuleReconfigure(Foo)",
            "Clock:parentReconfigure",
            "Bar:dependencyReconfigure(Foo)"
        ]
    );
    assert_eq!(foo.config()["tz"], "UTC");
    assert_eq!(foo.config()["paths"]["utilities"], "utilities");
    tear_down(&root).await;
}

#[tokio::test]
async fn failing_dependant_surfaces_the_whole_chain() {
    let mut fx = Fixture::new();
    fx.unit("services/Foo", probe(ModuleKind::Service, "Foo"), "")
        .unit(
            "services/Bar",
            probe(ModuleKind::Service, "Bar")
                .deps(&["Foo"])
                .failing("dependencyReconfigure"),
            "",
        );
    let root = fx.root();
    bring_up(&root).await;
    let foo = root.find("services/Foo").unwrap();

    let err = foo.reconfigure(json!({"a": 2})).await.unwrap_err();
    assert_eq!(
        error_chain(&err),
        "Foo::reconfigure: dependant notification failed: \
         Bar::dependencyReconfigure: module callback failed: Bar refused dependencyReconfigure"
    );
    // The new value stays in place.
    assert_eq!(*foo.config(), json!({"a": 2}));
    tear_down(&root).await;
}

#[tokio::test]
async fn persistence_without_backend_is_refused() {
    let mut fx = Fixture::new();
    fx.unit("services/Foo", probe(ModuleKind::Service, "Foo"), "");
    let root = fx.root();
    root.load(None).await.unwrap();
    let foo = root.find("services/Foo").unwrap();

    let err = foo.save_config(&json!({"a": 1})).await.unwrap_err();
    assert!(matches!(err, ModuleError::NoBackend { .. }));
    assert_eq!(
        err.to_string(),
        "Foo::saveConfig: no configuration backend attached"
    );
    assert!(matches!(
        foo.set_enabled(false).await,
        Err(ModuleError::NoBackend { .. })
    ));
    assert!(foo.stored_state().await.is_err());
    root.unload().await.unwrap();
}

#[tokio::test]
async fn bootstrapping_service_binds_ancestor_dependencies_before_it_starts() {
    let mut fx = Fixture::new();
    fx.unit("services/Db", probe(ModuleKind::Service, "Db"), "")
        .unit(
            "components/Shop",
            probe(ModuleKind::Component, "Shop"),
            "config:\n  paths:\n    services: services\n",
        )
        .unit(
            "components/Shop/services/Configuration",
            probe(ModuleKind::Service, CONFIGURATION_SERVICE).deps(&["Db"]),
            "",
        );
    let root = fx.root();

    root.load(None).await.unwrap();
    let service = root.find("components/Shop/services/Configuration").unwrap();
    assert_eq!(service.phase(), Phase::Started);
    let db = service.dependencies().handle("Db").unwrap().unit().unwrap();
    assert_eq!(db.path(), "services/Db");
    assert_eq!(db.dependants()[0].path(), service.path());

    root.initialize().await.unwrap();
    root.start().await.unwrap();
    assert_eq!(fx.count("Configuration:start"), 1);
    tear_down(&root).await;
}

#[tokio::test]
async fn bootstrapping_service_cannot_depend_on_a_sibling() {
    let mut fx = Fixture::new();
    fx.unit(
        "services/Configuration",
        probe(ModuleKind::Service, CONFIGURATION_SERVICE).deps(&["Db"]),
        "",
    )
    .unit("services/Db", probe(ModuleKind::Service, "Db"), "");
    let root = fx.root();

    let err = root.load(None).await.unwrap_err();
    assert!(matches!(err, ModuleError::LoaderLoad { .. }));
    assert!(error_chain(&err).ends_with("Configuration::start: dependency 'Db' not found"));
    assert_eq!(fx.count("Configuration:load"), 0);
    assert_eq!(root.phase(), Phase::Unloaded);
}
