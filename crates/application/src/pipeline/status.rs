use domain::{MessageId, PipelineStatus, StatusUpdate};
use tracing::debug;

use super::handler::StatusRecorder;

/// 三个阶段都已落地时标记为 completed
pub async fn check_completion<R: StatusRecorder + ?Sized>(recorder: &R, message_id: MessageId) {
    let Some(status) = recorder.message_status(message_id).await else {
        return;
    };
    if !status.status.is_terminal_success() && status.all_stages_done() {
        recorder
            .update_message_status(message_id, StatusUpdate::Status(PipelineStatus::Completed))
            .await;
        debug!(message_id = %message_id, "消息处理完成");
    }
}
