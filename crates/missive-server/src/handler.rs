//! Handler traits and the built-in responders.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use missive_peer::Correspondence;
use missive_wire::MessageError;

use crate::fault::Fault;
use crate::view::WritableCorrespondence;

/// A correspondence handler, registered per subject.
///
/// The handler owns the correspondence it is given and must terminate it
/// (`finish` or `error`) before returning; returning with the write side
/// still open raises an unfinished-correspondence error on the server.
///
/// Any `Fn(Arc<Correspondence>) -> impl Future<Output = Result<(), Fault>>`
/// is a handler.
pub trait Handler: Send + Sync + 'static {
    fn call(
        &self,
        correspondence: Arc<Correspondence>,
    ) -> Pin<Box<dyn Future<Output = Result<(), Fault>> + Send + 'static>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Arc<Correspondence>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Fault>> + Send + 'static,
{
    fn call(
        &self,
        correspondence: Arc<Correspondence>,
    ) -> Pin<Box<dyn Future<Output = Result<(), Fault>> + Send + 'static>> {
        Box::pin((self)(correspondence))
    }
}

/// An exception handler: runs when a correspondence handler fails, with a
/// write-only view of the correspondence and the fault. Returning `Err`
/// aborts the pipeline; the server then answers with a generic error frame.
pub trait ExceptionHandler: Send + Sync + 'static {
    fn call(
        &self,
        correspondence: WritableCorrespondence,
        fault: Fault,
    ) -> Pin<Box<dyn Future<Output = Result<(), Fault>> + Send + 'static>>;
}

impl<F, Fut> ExceptionHandler for F
where
    F: Fn(WritableCorrespondence, Fault) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Fault>> + Send + 'static,
{
    fn call(
        &self,
        correspondence: WritableCorrespondence,
        fault: Fault,
    ) -> Pin<Box<dyn Future<Output = Result<(), Fault>> + Send + 'static>> {
        Box::pin((self)(correspondence, fault))
    }
}

/// The initial default handler: rejects every subject it sees.
pub struct UnknownSubjectHandler;

impl Handler for UnknownSubjectHandler {
    fn call(
        &self,
        correspondence: Arc<Correspondence>,
    ) -> Pin<Box<dyn Future<Output = Result<(), Fault>> + Send + 'static>> {
        Box::pin(async move {
            let subject = correspondence.subject();
            correspondence
                .error(MessageError::new(
                    "UnknownSubject",
                    format!("Unknown subject: {subject}"),
                ))
                .await?;
            Ok(())
        })
    }
}

/// The exception handler pinned at the tail of the chain. Guarantees that
/// some error frame reaches the remote side when a handler fails without
/// terminating its correspondence.
pub struct DefaultExceptionHandler;

impl ExceptionHandler for DefaultExceptionHandler {
    fn call(
        &self,
        correspondence: WritableCorrespondence,
        fault: Fault,
    ) -> Pin<Box<dyn Future<Output = Result<(), Fault>> + Send + 'static>> {
        Box::pin(async move {
            let error = MessageError::new(
                fault.kind().unwrap_or("UnknownError"),
                fault.message().unwrap_or("Unexpected error occurred!"),
            );
            correspondence.error(error).await?;
            Ok(())
        })
    }
}
