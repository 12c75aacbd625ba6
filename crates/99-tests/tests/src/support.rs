use fusion::{FusionConfig, Role, World};
use std::thread;
use std::time::{Duration, Instant};
use voodoo::{Manager, SuperRegistry, VoodooConfig};

/// A fresh world in its own directory, entered as master.
pub fn master() -> (tempfile::TempDir, FusionConfig, World) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = FusionConfig::default()
        .with_shm_dir(dir.path())
        .with_arena_size(4 * 1024 * 1024)
        .with_call_timeout(Duration::from_secs(5));
    let world = World::enter(0, Role::Master, &config).expect("enter master");
    (dir, config, world)
}

pub fn slave(config: &FusionConfig) -> World {
    World::enter(0, Role::Slave, config).expect("enter slave")
}

/// Client and serving manager joined by a socket pair; the serving side
/// has a dispatcher running.
pub fn connected(config: VoodooConfig, supers: SuperRegistry) -> (Manager, Manager) {
    let (client, server) = Manager::pair(config, supers).expect("manager pair");
    server.spawn_dispatcher().expect("dispatcher");
    (client, server)
}

pub fn wait_for(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(2));
    }
}
