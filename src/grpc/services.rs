use tokio::sync::mpsc::{Receiver, Sender, channel};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::{
    constants::{PROGRESS_CAPACITY, STREAM_CAPACITY},
    core::{
        checkers::service::{CheckerService, CheckerStatus},
        domain::{self, GradeEvent},
        pipeline::{
            building::BuildHandle,
            grading::{Grader, GradingError},
        },
    },
    grpc::models::{
        self, CheckerLog, CheckerRef, CreateCheckerRequest, Empty, GradeRequest, RunRequest,
        RunResponse, UpdateCheckerRequest, grading_service_server::GradingService,
    },
};

#[derive(Clone, Debug)]
pub struct GradingServiceImpl {
    grader: Grader,
    checkers: CheckerService,
}

#[tonic::async_trait]
impl GradingService for GradingServiceImpl {
    type GradeStream = ReceiverStream<Result<models::GradeEvent, Status>>;

    #[tracing::instrument(skip_all)]
    async fn grade(
        &self,
        request: Request<GradeRequest>,
    ) -> Result<Response<Self::GradeStream>, Status> {
        let request: domain::GradingRequest = request.into_inner().try_into()?;
        tracing::info!(
            language = %request.language,
            task_type = ?request.task_type,
            cases = request.cases.len(),
            "Received grading request"
        );

        let (stream_tx, stream_rx) = channel(STREAM_CAPACITY);
        let (progress_tx, progress_rx) = channel(PROGRESS_CAPACITY);
        let grader = self.grader.clone();

        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let watcher = tokio::spawn(cancel_on_disconnect(stream_tx.clone(), cancel.clone()));
            let forwarding = tokio::spawn(forward_events(progress_rx, stream_tx.clone()));

            let outcome = grader.grade_with(request, Some(progress_tx), &cancel).await;
            let _ = forwarding.await;
            watcher.abort();

            match outcome {
                Ok(_) => {}
                Err(GradingError::Cancelled) => tracing::info!("grading cancelled by client"),
                Err(error) => {
                    tracing::warn!(error = %error, "grading failed");
                    let _ = stream_tx.send(Err(error.into())).await;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(stream_rx)))
    }

    #[tracing::instrument(skip_all)]
    async fn run(&self, request: Request<RunRequest>) -> Result<Response<RunResponse>, Status> {
        let req = request.into_inner();
        let report = self.grader.run(&req.code, &req.language, &req.input).await?;
        Ok(Response::new(report.into()))
    }

    #[tracing::instrument(skip_all)]
    async fn create_checker(
        &self,
        request: Request<CreateCheckerRequest>,
    ) -> Result<Response<models::CheckerStatus>, Status> {
        let req = request.into_inner();
        let wait = req.wait;
        let (status, handle) = self.checkers.create(req.into()).await?;
        self.settle(status, Some(handle), wait).await
    }

    #[tracing::instrument(skip_all)]
    async fn update_checker(
        &self,
        request: Request<UpdateCheckerRequest>,
    ) -> Result<Response<models::CheckerStatus>, Status> {
        let req = request.into_inner();
        let (id, owner, wait) = (req.checker_id, req.owner_id, req.wait);
        let (status, handle) = self.checkers.update(id, owner, req.into()).await?;
        self.settle(status, handle, wait).await
    }

    #[tracing::instrument(skip_all)]
    async fn delete_checker(
        &self,
        request: Request<CheckerRef>,
    ) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.checkers.delete(req.checker_id, req.owner_id).await?;
        Ok(Response::new(Empty {}))
    }

    async fn get_checker(
        &self,
        request: Request<CheckerRef>,
    ) -> Result<Response<models::CheckerStatus>, Status> {
        let req = request.into_inner();
        let status = self.checkers.status(req.checker_id, req.owner_id)?;
        Ok(Response::new(status.into()))
    }

    async fn get_checker_log(
        &self,
        request: Request<CheckerRef>,
    ) -> Result<Response<CheckerLog>, Status> {
        let req = request.into_inner();
        let log = self.checkers.build_log(req.checker_id, req.owner_id).await?;
        Ok(Response::new(log.into()))
    }
}

impl GradingServiceImpl {
    pub fn new(grader: Grader, checkers: CheckerService) -> Self {
        Self { grader, checkers }
    }

    /// With `wait`, answers only after the queued build finished and reports the state it left.
    async fn settle(
        &self,
        status: CheckerStatus,
        handle: Option<BuildHandle>,
        wait: bool,
    ) -> Result<Response<models::CheckerStatus>, Status> {
        let Some(handle) = handle.filter(|_| wait) else {
            return Ok(Response::new(status.into()));
        };
        if let Err(failure) = handle.wait().await {
            tracing::debug!(checker_id = status.checker.id, error = %failure, "awaited build failed");
        }
        let status = self.checkers.status(status.checker.id, status.checker.owner)?;
        Ok(Response::new(status.into()))
    }
}

async fn forward_events(
    mut progress_rx: Receiver<GradeEvent>,
    stream_tx: Sender<Result<models::GradeEvent, Status>>,
) {
    while let Some(event) = progress_rx.recv().await {
        tracing::debug!("Send grading event: {:?}", event);
        if stream_tx.send(Ok(event.into())).await.is_err() {
            break;
        }
    }
}

async fn cancel_on_disconnect(
    stream_tx: Sender<Result<models::GradeEvent, Status>>,
    cancel: CancellationToken,
) {
    stream_tx.closed().await;
    tracing::debug!("Client disconnected");
    cancel.cancel();
}
