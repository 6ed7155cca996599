//! Builds the sink set for one invocation from the upload options.

use std::sync::Arc;
use tracing::warn;

use crate::config::UploadOptions;
use crate::encoding::EventEncoding;
use crate::error::SinkError;
use crate::lifecycle::InvocationContext;
use crate::reporter::Message;
use crate::sinks::file::open_file_sink;
use crate::sinks::remote::{open_remote_sink, BackendClient};
use crate::sinks::{BACKEND_SINK, BINARY_FILE_SINK, TEXT_FILE_SINK};
use crate::transport::Transport;

#[derive(Default)]
pub struct OpenedSinks {
    pub transports: Vec<Arc<dyn Transport>>,
    pub failures: Vec<SinkError>,
}

impl OpenedSinks {
    pub fn names(&self) -> Vec<String> {
        self.transports.iter().map(|t| t.name().to_string()).collect()
    }
}

fn encoding_for(key: &str) -> EventEncoding {
    match key {
        TEXT_FILE_SINK => EventEncoding::Text,
        BINARY_FILE_SINK => EventEncoding::Binary,
        _ => EventEncoding::Json,
    }
}

/// Open every configured sink. A sink that cannot be constructed is dropped
/// with a warning; the invocation continues with the rest.
pub fn open_sinks(
    options: &UploadOptions,
    context: &InvocationContext,
    backend: Option<Arc<dyn BackendClient>>,
) -> OpenedSinks {
    let mut opened = OpenedSinks::default();

    for (key, file) in options.file_sinks() {
        match open_file_sink(key, file, encoding_for(key), context.reporter.clone()) {
            Ok(sink) => opened.transports.push(Arc::new(sink)),
            Err(err) => {
                warn!(sink = key, path = %file.path.display(), error = %err, "dropping build event sink");
                context.reporter.handle(Message::warn(format!(
                    "Unable to write to '{}'. Omitting {} build event sink: {}",
                    file.path.display(),
                    key,
                    err
                )));
                opened.failures.push(err);
            }
        }
    }

    if let (Some(backend_options), Some(client)) = (&options.backend, backend) {
        let sink = open_remote_sink(
            BACKEND_SINK,
            client,
            backend_options,
            context,
            context.reporter.clone(),
        );
        opened.transports.push(Arc::new(sink));
    }

    opened
}
