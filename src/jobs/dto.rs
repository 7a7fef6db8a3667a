use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::repo_types::{JobChanges, JobFilter, JobStatus, NewJob};

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub search: Option<String>,
}

impl ListJobsQuery {
    /// `status=all` (or blank) means no status filter.
    pub fn into_filter(self) -> Result<JobFilter, String> {
        let status = match self.status.as_deref().map(str::trim) {
            None | Some("") | Some("all") => None,
            Some(s) => Some(s.parse::<JobStatus>()?),
        };
        Ok(JobFilter {
            status,
            search: self.search,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub company: Option<String>,
    pub position: Option<String>,
    pub status: Option<String>,
    pub notes: Option<String>,
}

fn required(field: &str, value: Option<String>) -> Result<String, String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format!("{field} is required"))
}

fn optional_status(status: Option<String>) -> Result<Option<JobStatus>, String> {
    status.map(|s| s.parse()).transpose()
}

impl TryFrom<CreateJobRequest> for NewJob {
    type Error = String;

    fn try_from(req: CreateJobRequest) -> Result<Self, Self::Error> {
        Ok(NewJob {
            company: required("company", req.company)?,
            position: required("position", req.position)?,
            status: optional_status(req.status)?.unwrap_or_default(),
            notes: req.notes,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateJobRequest {
    pub company: Option<String>,
    pub position: Option<String>,
    pub status: Option<String>,
    pub notes: Option<String>,
}

impl TryFrom<UpdateJobRequest> for JobChanges {
    type Error = String;

    fn try_from(req: UpdateJobRequest) -> Result<Self, Self::Error> {
        let non_blank = |field: &str, v: Option<String>| match v {
            Some(v) => required(field, Some(v)).map(Some),
            None => Ok(None),
        };
        Ok(JobChanges {
            company: non_blank("company", req.company)?,
            position: non_blank("position", req.position)?,
            status: optional_status(req.status)?,
            notes: req.notes,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchDeleteRequest {
    pub ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<u64>,
}
