//! Typed caller for the calculator service.

use crate::call::CallOptions;
use crate::client::Channel;
use crate::status::Status;
use crate::stream::{ResponseHandle, Sink, Streaming};

use super::messages::{
    AddRequest, AddResponse, AverageRequest, AverageResponse, FindMaxRequest, FindMaxResponse,
    PrimeNumberDecompositionRequest, PrimeNumberDecompositionResponse, SquareRootRequest,
    SquareRootResponse,
};
use super::{ADD, AVERAGE, FIND_MAX, PRIME_NUMBER_DECOMPOSITION, SQUARE_ROOT};

/// One method per calculator operation, over a shared [`Channel`].
///
/// Convenience methods (`average`, `find_max`, `prime_factors`) drive a
/// whole call; the `*_stream` variants hand back the raw streams.
#[derive(Clone)]
pub struct CalculatorClient {
    channel: Channel,
    options: CallOptions,
}

impl CalculatorClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            options: CallOptions::default(),
        }
    }

    /// Apply `options` (e.g. a deadline) to every call made by this client.
    #[must_use]
    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub async fn add(&self, first: i64, second: i64) -> Result<i64, Status> {
        let response: AddResponse = self
            .channel
            .unary(&ADD, &AddRequest { first, second }, self.options)
            .await?;
        Ok(response.sum)
    }

    pub async fn prime_number_decomposition(
        &self,
        number: i64,
    ) -> Result<Streaming<PrimeNumberDecompositionResponse>, Status> {
        self.channel
            .server_streaming(
                &PRIME_NUMBER_DECOMPOSITION,
                &PrimeNumberDecompositionRequest { number },
                self.options,
            )
            .await
    }

    /// All prime factors of `number`, smallest first.
    pub async fn prime_factors(&self, number: i64) -> Result<Vec<i64>, Status> {
        let responses = self.prime_number_decomposition(number).await?;
        let factors = responses.collect().await?;
        Ok(factors.into_iter().map(|r| r.factor).collect())
    }

    pub async fn average_stream(
        &self,
    ) -> Result<(Sink<AverageRequest>, ResponseHandle<AverageResponse>), Status> {
        self.channel.client_streaming(&AVERAGE, self.options).await
    }

    /// Send every number, then wait for their average.
    pub async fn average<I>(&self, numbers: I) -> Result<f64, Status>
    where
        I: IntoIterator<Item = i64>,
    {
        let (requests, response) = self.average_stream().await?;
        for number in numbers {
            requests.send(&AverageRequest { number }).await?;
        }
        requests.complete().await?;
        Ok(response.response().await?.average)
    }

    pub async fn find_max_stream(
        &self,
    ) -> Result<(Sink<FindMaxRequest>, Streaming<FindMaxResponse>), Status> {
        self.channel.bidi_streaming(&FIND_MAX, self.options).await
    }

    /// Send numbers one at a time, collecting the running maximum returned
    /// after each.
    pub async fn find_max<I>(&self, numbers: I) -> Result<Vec<i64>, Status>
    where
        I: IntoIterator<Item = i64>,
    {
        let (requests, mut responses) = self.find_max_stream().await?;
        let mut maxima = Vec::new();

        for number in numbers {
            requests.send(&FindMaxRequest { number }).await?;
            match responses.message().await? {
                Some(response) => maxima.push(response.max),
                None => return Err(Status::internal("FindMax ended before replying")),
            }
        }
        requests.complete().await?;

        // Drain to the completion so the call ends cleanly.
        while let Some(response) = responses.message().await? {
            maxima.push(response.max);
        }
        Ok(maxima)
    }

    pub async fn square_root(&self, number: i32) -> Result<f64, Status> {
        let response: SquareRootResponse = self
            .channel
            .unary(&SQUARE_ROOT, &SquareRootRequest { number }, self.options)
            .await?;
        Ok(response.root)
    }
}
