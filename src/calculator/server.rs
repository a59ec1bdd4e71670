//! Handlers for the calculator methods.
//!
//! Each handler adapts the transport to the domain [`Service`]; the
//! per-call accumulators live on the handler's stack for exactly as long as
//! the call.

use std::sync::Arc;

use tracing::{debug, warn};

use super::domain::{Average, RunningMax, Service};
use super::messages::{
    AddRequest, AddResponse, AverageRequest, AverageResponse, FindMaxRequest, FindMaxResponse,
    PrimeNumberDecompositionRequest, PrimeNumberDecompositionResponse, SquareRootRequest,
    SquareRootResponse,
};
use super::{ADD, AVERAGE, FIND_MAX, PRIME_NUMBER_DECOMPOSITION, SQUARE_ROOT};
use crate::handler::Router;
use crate::status::Status;
use crate::stream::{Sink, StreamEvent, Streaming};

/// Routing table with every calculator method.
pub fn router() -> Router {
    CalculatorService::default().into_router()
}

/// Transport-facing calculator that wraps the domain [`Service`].
#[derive(Clone, Default)]
pub struct CalculatorService {
    service: Arc<Service>,
}

impl CalculatorService {
    pub fn new(service: Arc<Service>) -> Self {
        Self { service }
    }

    pub async fn add(&self, request: AddRequest) -> Result<AddResponse, Status> {
        let sum = self.service.add(request.first, request.second);
        Ok(AddResponse { sum })
    }

    /// Streams the prime factors of the requested number, smallest first.
    pub async fn prime_number_decomposition(
        &self,
        request: PrimeNumberDecompositionRequest,
        responses: Sink<PrimeNumberDecompositionResponse>,
    ) -> Result<(), Status> {
        for factor in self.service.prime_factors(request.number) {
            responses
                .send(&PrimeNumberDecompositionResponse { factor })
                .await
                .map_err(Status::from)?;
        }
        Ok(())
    }

    /// Averages every number the caller sends.
    ///
    /// If the caller fails its direction mid-stream the failure is logged and
    /// the average of what arrived is produced anyway; the transport then
    /// drops it, since the call has already failed.
    pub async fn average(
        &self,
        mut requests: Streaming<AverageRequest>,
    ) -> Result<AverageResponse, Status> {
        let mut average = Average::default();

        while let Some(event) = requests.next_event().await {
            match event {
                StreamEvent::Message(request) => average.push(request.number),
                StreamEvent::Completed => break,
                StreamEvent::Failed(status) => {
                    warn!(
                        call_id = requests.call_id(),
                        received = average.count(),
                        "Caller failed during Average: {}",
                        status
                    );
                    break;
                }
            }
        }

        Ok(AverageResponse {
            average: average.value(),
        })
    }

    /// Replies to every number with the largest number seen so far.
    pub async fn find_max(
        &self,
        mut requests: Streaming<FindMaxRequest>,
        responses: Sink<FindMaxResponse>,
    ) -> Result<(), Status> {
        let mut max = RunningMax::default();

        while let Some(event) = requests.next_event().await {
            match event {
                StreamEvent::Message(request) => {
                    let current = max.observe(request.number);
                    responses
                        .send(&FindMaxResponse { max: current })
                        .await
                        .map_err(Status::from)?;
                }
                StreamEvent::Completed => break,
                StreamEvent::Failed(status) => {
                    debug!(call_id = requests.call_id(), "FindMax stopped: {}", status);
                    break;
                }
            }
        }
        Ok(())
    }

    pub async fn square_root(&self, request: SquareRootRequest) -> Result<SquareRootResponse, Status> {
        let root = self.service.square_root(request.number)?;
        Ok(SquareRootResponse { root })
    }

    /// Register every method on a new [`Router`].
    pub fn into_router(self) -> Router {
        let add = self.clone();
        let primes = self.clone();
        let average = self.clone();
        let find_max = self.clone();
        let square_root = self;

        Router::new()
            .unary(&ADD, move |request| {
                let service = add.clone();
                async move { service.add(request).await }
            })
            .server_streaming(&PRIME_NUMBER_DECOMPOSITION, move |request, responses| {
                let service = primes.clone();
                async move { service.prime_number_decomposition(request, responses).await }
            })
            .client_streaming(&AVERAGE, move |requests| {
                let service = average.clone();
                async move { service.average(requests).await }
            })
            .bidi_streaming(&FIND_MAX, move |requests, responses| {
                let service = find_max.clone();
                async move { service.find_max(requests, responses).await }
            })
            .unary(&SQUARE_ROOT, move |request| {
                let service = square_root.clone();
                async move { service.square_root(request).await }
            })
    }
}
