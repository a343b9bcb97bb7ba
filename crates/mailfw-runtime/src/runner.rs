//! The service loop executed inside a driver worker.

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;

use crate::conduit::{Receiver, Serve};
use crate::interruption::{Fault, HandlerEmitter, Interruption, PANIC_CATEGORY};

/// Serve commands from `receiver` until told to stop.
///
/// A fault or panic inside `serve_next` ends the loop: the full diagnostic
/// is logged here, and only the category and message are escalated through
/// `handler`, exactly once. A clean stop escalates nothing.
pub async fn run_driver<S: Serve>(
    worker_name: String,
    mut receiver: Receiver<S>,
    handler: HandlerEmitter,
) {
    tracing::debug!(worker = %worker_name, "Starts serving");

    let interruption = loop {
        match AssertUnwindSafe(receiver.serve_next()).catch_unwind().await {
            Ok(Ok(true)) => continue,
            Ok(Ok(false)) => {
                tracing::debug!(
                    worker = %worker_name,
                    served = receiver.served(),
                    "Stopped serving"
                );
                return;
            }
            Ok(Err(fault)) => {
                let category = fault.category().into_owned();
                tracing::error!(
                    worker = %worker_name,
                    category = %category,
                    error = %error_chain(&fault),
                    backtrace = %Backtrace::force_capture(),
                    "Driver fault"
                );
                break Interruption::new(&worker_name, category, fault.to_string());
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(
                    worker = %worker_name,
                    panic = %message,
                    backtrace = %Backtrace::force_capture(),
                    "Driver panicked"
                );
                break Interruption::new(&worker_name, PANIC_CATEGORY, message);
            }
        }
    };

    handler.interruption_error(interruption);
    tracing::debug!(worker = %worker_name, "Runner ended after interruption");
}

/// `outer: inner: root`
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conduit::DriverManager;
    use crate::interruption::handler_channel;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, thiserror::Error)]
    #[error("mailbox {0} vanished")]
    struct Vanished(u32, #[source] std::io::Error);

    impl Fault for Vanished {
        fn category(&self) -> std::borrow::Cow<'_, str> {
            "vanished".into()
        }
    }

    /// Fails with `Vanished` on 13, panics on 99.
    struct Picky {
        seen: Vec<u32>,
    }

    #[async_trait]
    impl Serve for Picky {
        type Command = u32;
        type Reply = ();
        type Error = Vanished;

        async fn serve(&mut self, command: u32) -> Result<(), Vanished> {
            match command {
                13 => Err(Vanished(
                    13,
                    std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
                )),
                99 => panic!("unexpected command 99"),
                n => {
                    self.seen.push(n);
                    Ok(())
                }
            }
        }
    }

    #[tokio::test]
    async fn test_clean_stop_escalates_nothing() {
        let (receiver, emitter) = DriverManager::new("w", Picky { seen: vec![] }, 4).split();
        let (handler, mut interruptions) = handler_channel();
        emitter.submit(1).await.unwrap();
        emitter.stop_serving().await;

        run_driver("w".to_string(), receiver, handler).await;

        assert!(interruptions.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_fault_escalates_once_and_stops() {
        let (receiver, emitter) = DriverManager::new("w", Picky { seen: vec![] }, 4).split();
        let (handler, mut interruptions) = handler_channel();
        for n in [1, 13, 2] {
            emitter.submit(n).await.unwrap();
        }

        run_driver("w".to_string(), receiver, handler).await;

        let interruption = interruptions.recv().await.unwrap();
        assert_eq!(interruption.worker, "w");
        assert_eq!(interruption.category, "vanished");
        assert_eq!(interruption.message, "mailbox 13 vanished");
        assert!(interruptions.recv().await.is_none());
        // The loop is gone, so the third command can no longer be fed.
        assert!(emitter.submit(3).await.is_err());
    }

    #[tokio::test]
    async fn test_panic_is_caught_and_escalated() {
        let (receiver, emitter) = DriverManager::new("w", Picky { seen: vec![] }, 4).split();
        let (handler, mut interruptions) = handler_channel();
        emitter.submit(99).await.unwrap();

        run_driver("w".to_string(), receiver, handler).await;

        let interruption = interruptions.recv().await.unwrap();
        assert!(interruption.is_panic());
        assert_eq!(interruption.message, "unexpected command 99");
        assert!(interruptions.try_recv().is_none());
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[tokio::test]
    async fn test_fault_diagnostic_is_logged_at_error() {
        let logs = Captured::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::ERROR)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (receiver, emitter) = DriverManager::new("w", Picky { seen: vec![] }, 4).split();
        let (handler, mut interruptions) = handler_channel();
        emitter.submit(13).await.unwrap();

        run_driver("logged".to_string(), receiver, handler).await;

        let interruption = interruptions.recv().await.unwrap();
        // Only the short message crosses to the parent; the chain stays local.
        assert_eq!(interruption.message, "mailbox 13 vanished");

        let output = logs.contents();
        assert!(output.contains("ERROR"), "{output}");
        assert!(output.contains("Driver fault"), "{output}");
        assert!(output.contains("worker=logged"), "{output}");
        assert!(output.contains("mailbox 13 vanished: gone"), "{output}");
        assert!(output.contains("backtrace="), "{output}");
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let err = Vanished(
            7,
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(error_chain(&err), "mailbox 7 vanished: gone");
    }

    #[test]
    fn test_panic_message_variants() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn Any + Send> = Box::new("borrowed");
        let other: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(borrowed.as_ref()), "borrowed");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
