use sea_orm::ActiveValue::Set;

use crate::storage::task::entity::{ActiveModel as TaskActiveModel, Model as TaskModel};
use crate::schedule::types::Task;

impl From<TaskModel> for Task {
    fn from(model: TaskModel) -> Self {
        Task {
            id: model.id,
            filename: model.filename,
            status: model.status,
            created_at: model.created_at,
            completed_at: model.completed_at,
            result: model.result,
            error: model.error,
        }
    }
}

impl From<Task> for TaskActiveModel {
    fn from(task: Task) -> Self {
        TaskActiveModel {
            id: Set(task.id),
            filename: Set(task.filename),
            status: Set(task.status),
            created_at: Set(task.created_at),
            completed_at: Set(task.completed_at),
            result: Set(task.result),
            error: Set(task.error),
        }
    }
}
