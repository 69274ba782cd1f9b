//! Two intercoms on an in-process mesh. `alice` talks for a second, `bob` listens.
//!
//! Run with `RUST_LOG=debug` to follow discovery, connection and playback.

use std::{
    f32::consts::TAU,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use intercom::{
    DeviceError, IntercomConfig, IntercomController, Level, PeerIdentity,
    transport::{event_queue, loopback::LoopbackMesh},
};
use parking_lot::Mutex;

fn start(
    mesh: &LoopbackMesh,
    identity: PeerIdentity,
    capture: impl FnMut() -> Result<Level, DeviceError> + Send + 'static,
) -> intercom::Result<(IntercomController, Arc<Mutex<Vec<Level>>>)> {
    let config = IntercomConfig::default();
    let (sink, events) = event_queue();
    let transport = Arc::new(mesh.join(identity.clone(), config.service_type.clone(), sink));

    let heard = Arc::new(Mutex::new(Vec::new()));
    let output = {
        let heard = Arc::clone(&heard);
        move |level: Level| -> Result<(), DeviceError> {
            heard.lock().push(level);
            Ok(())
        }
    };

    let controller = IntercomController::init(config, identity, transport, events, capture, output)?;

    Ok((controller, heard))
}

fn main() -> intercom::Result<()> {
    env_logger::init();

    let mesh = LoopbackMesh::new();

    // a slow sine sweep, as a microphone level meter would show a voice
    let start_time = Instant::now();
    let alice_mic = move || -> Result<Level, DeviceError> {
        let t = start_time.elapsed().as_secs_f32();
        Ok(0.5 + 0.5 * (TAU * t).sin())
    };
    let bob_mic = || -> Result<Level, DeviceError> { Ok(0.) };

    let (alice, _) = start(&mesh, PeerIdentity::new(0xa11ce, "alice"), alice_mic)?;
    let (bob, bob_heard) = start(&mesh, PeerIdentity::new(0xb0b, "bob"), bob_mic)?;

    while bob.session().connected_peers().is_empty() {
        thread::sleep(Duration::from_millis(10));
    }

    println!("{} and {} are connected", alice.local(), bob.local());

    alice.toggle_talk()?;
    thread::sleep(Duration::from_secs(1));
    alice.toggle_talk()?;

    // let the last samples drain
    thread::sleep(Duration::from_millis(200));

    alice.shutdown();
    bob.shutdown();

    let heard = bob_heard.lock();
    let audible = heard.iter().filter(|&&level| level > 0.).count();

    println!(
        "bob played {} ticks, {audible} of them audible. last levels: {:.2?}",
        heard.len(),
        &heard[heard.len().saturating_sub(8)..],
    );

    println!("alice's session: {:?}", alice.session().stats());
    println!("bob's playback: {:?}", bob.playback().stats());

    Ok(())
}
