use std::sync::Arc;

use tracing::{debug, trace};

use reverie_protocol::io::FrameReader;

use crate::machine::{BoxedRead, StateMachine};

/// The incoming-notification activity: pump frames off the stream and
/// fire the matching rendezvous until the runtime closes its half.
///
/// Runs concurrently with the handler activity and only ever touches the
/// completion managers. On stream closure or a poisoned frame, the
/// invocation's linked cancellation token fires and pending rendezvous
/// are drained, so the handler observes the closure as an abort whether
/// it is awaiting a completion or watching the token.
pub(crate) async fn incoming_loop(
    mut reader: FrameReader<BoxedRead>,
    machine: Arc<StateMachine>,
) {
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => {
                trace!(ty = ?frame.ty(), len = frame.payload.len(), "incoming frame");
                if let Err(err) = machine.route_notification(&frame) {
                    debug!(error = %err, "failed to route incoming frame, stopping reader");
                    machine.notify_stream_closed();
                    return;
                }
            }
            Ok(None) => {
                machine.notify_stream_closed();
                return;
            }
            Err(err) => {
                debug!(error = %err, "incoming stream failed");
                machine.notify_stream_closed();
                return;
            }
        }
    }
}
