//! Calculator service: five operations, one per interaction pattern.
//!
//! | Method                     | ID | Pattern          |
//! |----------------------------|----|------------------|
//! | `Add`                      | 1  | unary            |
//! | `PrimeNumberDecomposition` | 2  | server-streaming |
//! | `Average`                  | 3  | client-streaming |
//! | `FindMax`                  | 4  | bidi-streaming   |
//! | `SquareRoot`               | 5  | unary            |
//!
//! [`router`] builds the routing table for a [`Server`](crate::Server);
//! [`CalculatorClient`] is the typed caller.

mod client;
mod domain;
mod messages;
mod server;

pub use client::CalculatorClient;
pub use domain::{prime_factors, square_root, Average, PrimeFactors, RunningMax, Service};
pub use messages::{
    AddRequest, AddResponse, AverageRequest, AverageResponse, FindMaxRequest, FindMaxResponse,
    PrimeNumberDecompositionRequest, PrimeNumberDecompositionResponse, SquareRootRequest,
    SquareRootResponse,
};
pub use server::{router, CalculatorService};

use crate::call::{MethodDescriptor, Pattern, ServiceDescriptor};

/// Fully qualified service name.
pub const SERVICE_NAME: &str = "calculator.CalculatorService";

pub const ADD: MethodDescriptor = MethodDescriptor {
    name: "Add",
    id: 1,
    pattern: Pattern::Unary,
};

pub const PRIME_NUMBER_DECOMPOSITION: MethodDescriptor = MethodDescriptor {
    name: "PrimeNumberDecomposition",
    id: 2,
    pattern: Pattern::ServerStreaming,
};

pub const AVERAGE: MethodDescriptor = MethodDescriptor {
    name: "Average",
    id: 3,
    pattern: Pattern::ClientStreaming,
};

pub const FIND_MAX: MethodDescriptor = MethodDescriptor {
    name: "FindMax",
    id: 4,
    pattern: Pattern::BidiStreaming,
};

pub const SQUARE_ROOT: MethodDescriptor = MethodDescriptor {
    name: "SquareRoot",
    id: 5,
    pattern: Pattern::Unary,
};

/// Every calculator method, in ID order.
pub const METHODS: &[MethodDescriptor] = &[
    ADD,
    PRIME_NUMBER_DECOMPOSITION,
    AVERAGE,
    FIND_MAX,
    SQUARE_ROOT,
];

pub const SERVICE: ServiceDescriptor = ServiceDescriptor {
    name: SERVICE_NAME,
    methods: METHODS,
};
