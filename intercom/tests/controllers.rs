//! Two full intercoms, with their own threads, talking over the loopback mesh.

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use intercom::{
    CaptureState, DeviceError, IntercomConfig, IntercomController, Level, PeerIdentity,
    transport::{event_queue, loopback::LoopbackMesh},
};
use parking_lot::Mutex;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);

    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }

    condition()
}

struct Device {
    controller: IntercomController,
    heard: Arc<Mutex<Vec<Level>>>,
}

fn device(mesh: &LoopbackMesh, id: u64, level: Level) -> Device {
    let config = IntercomConfig {
        tick_interval_ms: 5,
        event_poll_interval_ms: 5,
        ..Default::default()
    };

    let local = PeerIdentity::new(id, format!("device-{id}"));
    let (sink, events) = event_queue();
    let transport = Arc::new(mesh.join(local.clone(), config.service_type.clone(), sink));

    let heard = Arc::new(Mutex::new(Vec::new()));
    let output = {
        let heard = Arc::clone(&heard);
        move |level: Level| -> Result<(), DeviceError> {
            heard.lock().push(level);
            Ok(())
        }
    };

    let capture = move || -> Result<Level, DeviceError> { Ok(level) };

    let controller =
        IntercomController::init(config, local, transport, events, capture, output).unwrap();

    Device { controller, heard }
}

#[test]
fn talking_is_heard_by_the_other_side() {
    init_logger();

    let mesh = LoopbackMesh::new();
    let a = device(&mesh, 1, 0.25);
    let b = device(&mesh, 2, 0.75);

    assert!(wait_until(|| {
        a.controller.session().connected_peers().len() == 1
            && b.controller.session().connected_peers().len() == 1
    }));

    assert_eq!(a.controller.toggle_talk(), Ok(CaptureState::Capturing));

    assert!(wait_until(|| b.heard.lock().contains(&0.25)));

    assert_eq!(a.controller.toggle_talk(), Ok(CaptureState::Idle));

    // reception is always on, but nobody else talked
    assert!(a.heard.lock().iter().all(|&level| level == 0.));
    assert!(!b.controller.is_talking());

    let sent = a.controller.capture().next_sequence();
    assert!(sent > 0);

    a.controller.shutdown();
    b.controller.shutdown();
}

#[test]
fn shutting_down_disconnects_the_other_side() {
    init_logger();

    let mesh = LoopbackMesh::new();
    let a = device(&mesh, 1, 0.5);
    let b = device(&mesh, 2, 0.5);

    assert!(wait_until(|| {
        b.controller.session().connected_peers() == [a.controller.local().clone()]
    }));

    drop(a);

    assert!(wait_until(|| b.controller.session().connected_peers().is_empty()));
    assert!(wait_until(|| b.controller.playback().active_peers().is_empty()));
}
