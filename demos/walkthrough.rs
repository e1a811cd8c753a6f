//! Walks through the life of a few deferreds: success, failure, a producer
//! that fails synchronously, and one whose timer fails later where no
//! `catch` can see it.
//!
//! Run with `RUST_LOG=deferred=debug` to see the scheduler at work.
use deferred::{uncaught, Deferred, Scheduler};
use std::time::Duration;
use tracing::info;

fn main() -> Result<(), deferred::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Installed at startup; receives what nothing else catches.
    uncaught::install(|failure| {
        info!("----------------");
        info!("now we can handle the asynchronous failure");
        info!(origin = %failure.origin(), "err: {}", failure.summary());
        info!("----------------");
    })?;

    let scheduler = Scheduler::new();

    let p1: Deferred<bool, String> = Deferred::new(&scheduler, |settle| {
        scheduler.set_timeout(Duration::from_millis(1000), move || settle.resolve(true));
        Ok(())
    });
    info!("p1: {p1:?}");

    let p2: Deferred<bool, String> = Deferred::new(&scheduler, |settle| {
        scheduler.set_timeout(Duration::from_millis(2000), move || {
            settle.reject("Some rejected value".into())
        });
        Ok(())
    });
    info!("p2: {p2:?}");

    let after_p1 = p1.and_then(|_| {
        info!("at this point, p1 must have been fulfilled");
        Ok("resolved value of after_p1".to_owned())
    });
    info!("after_p1: {after_p1:?}");

    let after_p2 = p2.catch(|err| {
        info!(%err, "at this point, p2 must have been rejected");
        Ok(false)
    });
    info!("after_p2: {after_p2:?}");

    let p3: Deferred<(), &str> = Deferred::new(&scheduler, |_settle| Err("Some exception"));
    info!("p3: {p3:?}");
    let _ = p3.catch(|err| {
        info!(err, "handling the exception");
        Ok(())
    });

    let p4: Deferred<(), &str> = Deferred::new(&scheduler, |_settle| {
        scheduler.set_timeout(Duration::from_millis(2000), || {
            Err::<(), _>("Some exception")
        });
        Ok(())
    });
    info!("p4: {p4:?}");
    let _ = p4.catch(|err| {
        // Never called.
        info!(err, "trying to handle the exception");
        Ok(())
    });

    scheduler.run_until_idle()?;

    info!("p1: {p1:?}");
    info!("p2: {p2:?}");
    info!("after_p1: {after_p1:?}");
    info!("after_p2: {after_p2:?}");
    info!("p4: {p4:?}");
    Ok(())
}
