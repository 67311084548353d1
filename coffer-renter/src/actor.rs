use std::time::Duration;

use backoff::backoff::Backoff;
use tokio::{
    select,
    task::{JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::{
    error::{is_cancelled, CancelError},
    retry::Retry,
    Error, Result,
};

/// A background service that answers requests over channels while it runs
/// its own event loop.
pub trait Actor {
    /// The type of request messages this service handles.
    type Request;
    /// The type of response messages this service returns.
    type Response;

    /// Run the service until cancelled.
    fn run(
        &mut self,
        cancel: CancellationToken,
        server_ch: ChanServer<Self::Request, Self::Response>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Handle a request message and produce a response.
    fn handle(
        &mut self,
        req: &Self::Request,
    ) -> impl std::future::Future<Output = Result<Self::Response>> + Send;
}

pub struct ChanClient<Request, Response> {
    tx: flume::Sender<Request>,
    rx: flume::Receiver<Response>,
}

impl<Request, Response> Clone for ChanClient<Request, Response> {
    fn clone(&self) -> Self {
        ChanClient {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<Request: Send + Sync + 'static, Response: Send + Sync + 'static>
    ChanClient<Request, Response>
{
    pub async fn send(&self, req: Request) -> Result<()> {
        self.tx.send_async(req).await.map_err(|e| e.into())
    }

    pub async fn recv(&mut self) -> Option<Response> {
        self.rx.recv_async().await.ok()
    }
}

pub struct ChanServer<Request, Response> {
    tx: flume::Sender<Response>,
    rx: flume::Receiver<Request>,
}

// Derived Clone would require Request: Clone and Response: Clone.
impl<Request, Response> Clone for ChanServer<Request, Response> {
    fn clone(&self) -> Self {
        ChanServer {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<Request, Response: Send + Sync + 'static> ChanServer<Request, Response> {
    pub async fn send(&self, resp: Response) -> Result<()> {
        self.tx.send_async(resp).await.map_err(|e| e.into())
    }

    pub async fn recv(&mut self) -> Option<Request> {
        self.rx.recv_async().await.ok()
    }
}

/// Owns a running actor task and the client side of its channels.
pub struct Operator<Req, Resp> {
    cancel: CancellationToken,
    client_ch: ChanClient<Req, Resp>,
    tasks: JoinSet<Result<()>>,
}

impl<Req: Send + Sync + 'static, Resp: Send + Sync + 'static> Operator<Req, Resp> {
    #[tracing::instrument(skip_all)]
    pub fn new<
        A: Actor<Request = Req, Response = Resp> + Send + 'static,
        R: Runner<A> + Send + 'static,
    >(
        cancel: CancellationToken,
        actor: A,
        mut runner: R,
    ) -> Self {
        let (client_ch, server_ch) = unbounded();
        let task_cancel = cancel.child_token();
        let mut tasks = JoinSet::new();
        tasks.spawn(async move { runner.run(actor, task_cancel, server_ch).await });
        Self {
            cancel,
            client_ch,
            tasks,
        }
    }

    #[tracing::instrument(skip_all, err)]
    pub async fn send(&mut self, req: Req) -> Result<()> {
        self.client_ch.send(req).await
    }

    #[tracing::instrument(skip_all)]
    pub async fn recv(&mut self) -> Option<Resp> {
        self.client_ch.recv().await
    }

    /// Send a request and wait for its response.
    pub async fn call(&mut self, req: Req) -> Result<Resp> {
        self.send(req).await?;
        self.recv()
            .await
            .ok_or(Error::msg("actor stopped before responding"))
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[tracing::instrument(skip_all, err)]
    pub async fn join(self) -> std::result::Result<Result<()>, JoinError> {
        for res in self.tasks.join_all().await.into_iter() {
            if let Err(e) = res {
                if is_cancelled(&e) {
                    continue;
                }
                return Ok(Err(e));
            }
        }
        Ok(Ok(()))
    }
}

pub trait Runner<A: Actor> {
    fn run(
        &mut self,
        actor: A,
        cancel: CancellationToken,
        server_ch: ChanServer<A::Request, A::Response>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Restart the actor after each error, backing off between restarts, until
/// cancelled. Background maintenance must outlive any single failure.
#[derive(Clone)]
pub struct UntilCancelled {
    retry: Retry,
}

impl Default for UntilCancelled {
    fn default() -> Self {
        UntilCancelled {
            retry: Retry {
                max_attempts: usize::MAX,
                initial_interval: Duration::from_millis(250),
                max_interval: Duration::from_secs(30),
            },
        }
    }
}

impl<
        A: Actor<Request: Send + Sync + 'static, Response: Send + Sync + 'static>
            + Send
            + Sync
            + 'static,
    > Runner<A> for UntilCancelled
{
    #[tracing::instrument(skip_all, err)]
    async fn run(
        &mut self,
        mut actor: A,
        cancel: CancellationToken,
        server_ch: ChanServer<A::Request, A::Response>,
    ) -> Result<()> {
        let mut backoff = self.retry.backoff();
        loop {
            select! {
                _ = cancel.cancelled() => {
                    return Err(CancelError.into())
                }
                res = actor.run(cancel.child_token(), server_ch.clone()) => {
                    match res {
                        Ok(()) => {
                            backoff.reset();
                        }
                        Err(e) if is_cancelled(&e) => {
                            return Err(e);
                        }
                        Err(e) => {
                            error!(err = ?e, "actor stopped, restarting");
                            let delay = backoff.next_backoff().unwrap_or(self.retry.max_interval);
                            select! {
                                _ = cancel.cancelled() => {
                                    return Err(CancelError.into())
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                            warn!(?delay, "actor restarted");
                        }
                    }
                }
            }
        }
    }
}

fn unbounded<Request, Response>() -> (ChanClient<Request, Response>, ChanServer<Request, Response>)
{
    let (client_tx, client_rx) = flume::unbounded();
    let (server_tx, server_rx) = flume::unbounded();
    (
        ChanClient {
            tx: client_tx,
            rx: server_rx,
        },
        ChanServer {
            tx: server_tx,
            rx: client_rx,
        },
    )
}
