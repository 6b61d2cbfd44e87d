use std::sync::Arc;

use log::debug;
use tokio::sync::{watch, Mutex, MutexGuard};

use crate::error::TransferError;

/// Capacity of each half of the transfer buffer pair. A frame plus the
/// inbound terminator must fit in this.
pub const SPI_BUFFER_SIZE: usize = 16;

/// Blocking full-duplex exchange with the attached peripheral.
///
/// `tx` and `rx` have the same length and the call returns once the bus
/// hardware has clocked every byte. A failure carries the transport's
/// raw status code.
pub trait PeripheralPort: Send + Sync {
    fn exchange(&self, tx: &[u8], rx: &mut [u8]) -> Result<(), i32>;
}

struct Shared {
    port: Option<Arc<dyn PeripheralPort>>,
    tx_buf: [u8; SPI_BUFFER_SIZE],
    rx_buf: [u8; SPI_BUFFER_SIZE],
}

/// Driver context: one mutex over the attached-port cell and the transfer
/// buffer pair. Transfers and attach/detach notifications all pass
/// through `shared`, so a single lock order covers every mutation and no
/// exchange can observe a half-updated port.
pub struct Driver {
    shared: Mutex<Shared>,
    shutdown: watch::Receiver<bool>,
}

impl Driver {
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Driver {
            shared: Mutex::new(Shared {
                port: None,
                tx_buf: [0; SPI_BUFFER_SIZE],
                rx_buf: [0; SPI_BUFFER_SIZE],
            }),
            shutdown,
        }
    }

    /// Lock the shared state, bailing out with `Interrupted` if the
    /// shutdown signal fires (or has already fired) while we wait.
    /// Nothing is modified on the interrupted path.
    async fn lock_interruptible(&self) -> Result<MutexGuard<'_, Shared>, TransferError> {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return Err(TransferError::Interrupted);
        }
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => Err(TransferError::Interrupted),
            guard = self.shared.lock() => Ok(guard),
        }
    }

    /// Bus-side notification that the peripheral is bound. Safe to race
    /// with in-flight transfers; they hold the same lock.
    pub async fn on_attach(&self, port: Arc<dyn PeripheralPort>) -> Result<(), TransferError> {
        let mut shared = self.lock_interruptible().await?;
        shared.port = Some(port);
        debug!("peripheral attached");
        Ok(())
    }

    /// Bus-side notification that the peripheral is gone.
    pub async fn on_detach(&self) -> Result<(), TransferError> {
        let mut shared = self.lock_interruptible().await?;
        shared.port = None;
        debug!("peripheral detached");
        Ok(())
    }

    pub async fn is_attached(&self) -> bool {
        self.shared.lock().await.port.is_some()
    }

    /// One full-duplex exchange of `outbound`. On success the returned
    /// buffer holds the inbound bytes plus a null terminator,
    /// `outbound.len() + 1` bytes in all.
    ///
    /// A failed exchange leaves the attachment state untouched; only
    /// `on_detach` clears it.
    pub async fn transfer(&self, outbound: &[u8]) -> Result<Vec<u8>, TransferError> {
        let len = outbound.len();
        if len + 1 > SPI_BUFFER_SIZE {
            return Err(TransferError::BufferOverflow {
                requested: len,
                capacity: SPI_BUFFER_SIZE,
            });
        }

        let mut shared = self.lock_interruptible().await?;
        let port = match &shared.port {
            Some(port) => Arc::clone(port),
            None => return Err(TransferError::NotAttached),
        };

        shared.tx_buf[..len].copy_from_slice(outbound);
        shared.rx_buf[..len].fill(0);

        let status = {
            let Shared { tx_buf, rx_buf, .. } = &mut *shared;
            port.exchange(&tx_buf[..len], &mut rx_buf[..len])
        };
        // Terminate the inbound text whatever the exchange reported; the
        // bounds check above keeps this inside the buffer.
        shared.rx_buf[len] = 0;

        status.map_err(TransferError::TransportError)?;

        let mut inbound = Vec::new();
        inbound
            .try_reserve_exact(len + 1)
            .map_err(|_| TransferError::AllocationExhausted)?;
        inbound.extend_from_slice(&shared.rx_buf[..=len]);
        debug!("exchange of {} bytes complete", len);
        Ok(inbound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Peripheral that answers every exchange with a fixed reply,
    /// records what it was sent and flags overlapping calls.
    struct EchoPort {
        reply: Vec<u8>,
        delay: Duration,
        busy: AtomicBool,
        overlapped: AtomicBool,
        calls: parking_lot::Mutex<Vec<Vec<u8>>>,
    }

    impl EchoPort {
        fn new(reply: &[u8]) -> Self {
            Self::with_delay(reply, Duration::ZERO)
        }

        fn with_delay(reply: &[u8], delay: Duration) -> Self {
            EchoPort {
                reply: reply.to_vec(),
                delay,
                busy: AtomicBool::new(false),
                overlapped: AtomicBool::new(false),
                calls: parking_lot::Mutex::new(Vec::new()),
            }
        }
    }

    impl PeripheralPort for EchoPort {
        fn exchange(&self, tx: &[u8], rx: &mut [u8]) -> Result<(), i32> {
            if self.busy.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            for (i, byte) in rx.iter_mut().enumerate() {
                *byte = self.reply.get(i).copied().unwrap_or(0);
            }
            self.calls.lock().push(tx.to_vec());
            self.busy.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailPort(i32);

    impl PeripheralPort for FailPort {
        fn exchange(&self, _tx: &[u8], _rx: &mut [u8]) -> Result<(), i32> {
            Err(self.0)
        }
    }

    fn test_driver() -> (watch::Sender<bool>, Arc<Driver>) {
        let (tx, rx) = watch::channel(false);
        (tx, Arc::new(Driver::new(rx)))
    }

    #[tokio::test]
    async fn test_transfer_without_peripheral() {
        let (_shutdown, driver) = test_driver();
        assert_eq!(
            driver.transfer(b"ping").await,
            Err(TransferError::NotAttached)
        );
    }

    #[tokio::test]
    async fn test_inbound_is_null_terminated() {
        let (_shutdown, driver) = test_driver();
        let port = Arc::new(EchoPort::new(b"hello"));
        driver.on_attach(port.clone()).await.unwrap();

        let inbound = driver.transfer(b"ping!").await.unwrap();
        assert_eq!(inbound.len(), 6);
        assert_eq!(&inbound[..5], b"hello");
        assert_eq!(inbound[5], 0);
        assert_eq!(port.calls.lock().as_slice(), &[b"ping!".to_vec()]);
    }

    #[tokio::test]
    async fn test_largest_frame_fits() {
        let (_shutdown, driver) = test_driver();
        driver.on_attach(Arc::new(EchoPort::new(b""))).await.unwrap();

        let inbound = driver.transfer(&[0xAA; 15]).await.unwrap();
        assert_eq!(inbound.len(), 16);
        assert_eq!(inbound[15], 0);
    }

    #[tokio::test]
    async fn test_oversized_transfer_is_rejected() {
        let (_shutdown, driver) = test_driver();
        let port = Arc::new(EchoPort::new(b""));
        driver.on_attach(port.clone()).await.unwrap();

        let err = driver.transfer(&[0; SPI_BUFFER_SIZE]).await.unwrap_err();
        assert_eq!(
            err,
            TransferError::BufferOverflow {
                requested: SPI_BUFFER_SIZE,
                capacity: SPI_BUFFER_SIZE,
            }
        );
        // The peripheral never saw the request.
        assert!(port.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_keeps_attachment() {
        let (_shutdown, driver) = test_driver();
        driver.on_attach(Arc::new(FailPort(-5))).await.unwrap();

        assert_eq!(
            driver.transfer(b"x").await,
            Err(TransferError::TransportError(-5))
        );
        assert!(driver.is_attached().await);
    }

    #[tokio::test]
    async fn test_detach_clears_handle() {
        let (_shutdown, driver) = test_driver();
        driver.on_attach(Arc::new(EchoPort::new(b"ok"))).await.unwrap();
        driver.transfer(b"a").await.unwrap();

        driver.on_detach().await.unwrap();
        assert!(!driver.is_attached().await);
        assert_eq!(driver.transfer(b"a").await, Err(TransferError::NotAttached));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_transfers_serialize() {
        let (_shutdown, driver) = test_driver();
        let port = Arc::new(EchoPort::with_delay(b"r", Duration::from_millis(5)));
        driver.on_attach(port.clone()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let driver = driver.clone();
            handles.push(tokio::spawn(async move {
                driver.transfer(&[i, i, i]).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(!port.overlapped.load(Ordering::SeqCst));
        assert_eq!(port.calls.lock().len(), 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_hotplug_never_tears_a_transfer() {
        let (_shutdown, driver) = test_driver();
        let port = Arc::new(EchoPort::new(b"ok"));

        let plugger = {
            let driver = driver.clone();
            let port = port.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    driver.on_attach(port.clone()).await.unwrap();
                    tokio::task::yield_now().await;
                    driver.on_detach().await.unwrap();
                }
            })
        };

        let completed = Arc::new(AtomicUsize::new(0));
        let mut readers = Vec::new();
        for _ in 0..3 {
            let driver = driver.clone();
            let completed = completed.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..50 {
                    match driver.transfer(b"abc").await {
                        Ok(inbound) => {
                            // Fully attached: a complete, terminated reply.
                            assert_eq!(inbound.len(), 4);
                            assert_eq!(inbound[3], 0);
                            completed.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(TransferError::NotAttached) => {}
                        Err(other) => panic!("unexpected error: {other:?}"),
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }

        plugger.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_interrupts_waiting_transfer() {
        let (shutdown, driver) = test_driver();
        let slow = Arc::new(EchoPort::with_delay(b"z", Duration::from_millis(200)));
        driver.on_attach(slow).await.unwrap();

        let holder = {
            let driver = driver.clone();
            tokio::spawn(async move { driver.transfer(b"first").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let waiter = {
            let driver = driver.clone();
            tokio::spawn(async move { driver.transfer(b"second").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.send(true).unwrap();

        assert_eq!(waiter.await.unwrap(), Err(TransferError::Interrupted));
        // The transfer that already held the lock runs to completion.
        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_lifecycle_calls() {
        let (shutdown, driver) = test_driver();
        shutdown.send(true).unwrap();

        let port = Arc::new(EchoPort::new(b""));
        assert_eq!(
            driver.on_attach(port).await,
            Err(TransferError::Interrupted)
        );
        assert_eq!(driver.on_detach().await, Err(TransferError::Interrupted));
    }
}
