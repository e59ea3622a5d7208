use std::time::Duration;

use tokio::{sync::watch, time::Instant};
use tracing::{debug, info};

use thermorelay_common::{BlinkEncoder, BlinkTiming, StatusSignal};

pub trait LedOutput: Send + 'static {
    fn set(&mut self, lit: bool);
}

#[derive(Debug, Default)]
pub struct LoggedLed {
    lit: bool,
}

impl LedOutput for LoggedLed {
    fn set(&mut self, lit: bool) {
        if self.lit != lit {
            debug!(lit, "status led");
        }
        self.lit = lit;
    }
}

pub fn spawn_status_led<O: LedOutput>(
    timing: BlinkTiming,
    signals: watch::Receiver<StatusSignal>,
    output: O,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(drive_status_led(BlinkEncoder::new(timing), signals, output))
}

async fn drive_status_led<O: LedOutput>(
    mut encoder: BlinkEncoder,
    mut signals: watch::Receiver<StatusSignal>,
    mut output: O,
) {
    let initial = *signals.borrow_and_update();
    encoder.apply(initial);
    output.set(false);

    let step = encoder.advance();
    output.set(step.level);
    let timer = tokio::time::sleep(Duration::from_millis(step.hold_ms));
    tokio::pin!(timer);

    loop {
        tokio::select! {
            () = &mut timer => {
                let step = encoder.advance();
                output.set(step.level);
                timer.as_mut().reset(Instant::now() + Duration::from_millis(step.hold_ms));
            }
            changed = signals.changed() => {
                if changed.is_err() {
                    break;
                }
                let signal = *signals.borrow_and_update();
                if !encoder.apply(signal) {
                    continue;
                }
                info!(code = ?encoder.mode().code(), "status led pattern switched");
                output.set(false);
                let step = encoder.advance();
                output.set(step.level);
                timer.as_mut().reset(Instant::now() + Duration::from_millis(step.hold_ms));
            }
        }
    }

    output.set(false);
}
