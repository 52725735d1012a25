//! Test support utilities shared across unit and integration tests.
//!
//! The fakes keep their state behind `std::sync::Mutex` so they satisfy the
//! `Send + Sync` bounds of the collaborator traits. Every method computes its
//! result synchronously and returns an already-resolved future.

use std::collections::{BTreeMap, VecDeque};
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::cloud::{
    Attachment, CloudError, CloudFuture, CreateSpec, InstanceApi, MetadataApi, Resource,
    ResourceApi, ResourceKind,
};
use crate::exec::{CommandOutput, CommandRunner, ExecFuture, SpawnError};
use crate::job::{JobHandle, JobKind, JobSnapshot, JobState};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn ready<'a, T: Send + 'a>(result: Result<T, CloudError>) -> CloudFuture<'a, T> {
    Box::pin(async move { result })
}

fn not_found(resource: &str, id: &str) -> CloudError {
    CloudError::NotFound {
        resource: resource.to_owned(),
        id: id.to_owned(),
    }
}

/// Provider status string a fake job reports for `state`.
#[must_use]
pub const fn scripted_status(kind: JobKind, state: JobState) -> &'static str {
    match (kind, state) {
        (JobKind::Compute, JobState::Pending) => "RUNNING",
        (JobKind::Compute, JobState::Success) => "SUCCESS",
        (JobKind::Compute, JobState::Failure) => "FAIL",
        (JobKind::VolumeCreate | JobKind::ShareCreate, JobState::Pending) => "creating",
        (
            JobKind::VolumeCreate | JobKind::ShareCreate | JobKind::ShareExtend,
            JobState::Success,
        ) => "available",
        (JobKind::VolumeCreate | JobKind::ShareCreate, JobState::Failure) => "error",
        (JobKind::ShareExtend, JobState::Pending) => "extending",
        (JobKind::ShareExtend, JobState::Failure) => "extending_error",
        (JobKind::TurboCreate, JobState::Pending) => "100",
        (JobKind::TurboCreate, JobState::Success) => "200",
        (JobKind::TurboCreate, JobState::Failure) => "303",
        (JobKind::TurboExtend, JobState::Pending) => "121",
        (JobKind::TurboExtend, JobState::Success) => "221",
        (JobKind::TurboExtend, JobState::Failure) => "321",
    }
}

/// Number of calls made against a [`FakeResourceApi`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CallCounts {
    /// `list_by_name` calls.
    pub list: usize,
    /// `create` calls.
    pub create: usize,
    /// `delete` calls.
    pub delete: usize,
    /// `expand` calls.
    pub expand: usize,
    /// `grant_access` calls.
    pub grant_access: usize,
    /// `job_status` calls.
    pub job_status: usize,
}

impl CallCounts {
    /// Sum of create, delete and expand calls.
    #[must_use]
    pub const fn mutations(&self) -> usize {
        self.create + self.delete + self.expand
    }
}

#[derive(Clone, Debug)]
enum JobEffect {
    Create(Resource),
    Expand { id: String, size_gb: u64 },
    Delete { id: String },
}

#[derive(Clone, Debug)]
struct FakeJob {
    kind: JobKind,
    entity: String,
    pending_left: u32,
    failure: Option<String>,
    effect: Option<JobEffect>,
}

#[derive(Debug, Default)]
struct ResourceState {
    resources: BTreeMap<String, Resource>,
    jobs: BTreeMap<String, FakeJob>,
    next_id: u32,
    pending_polls: u32,
    fail_next_job: Option<String>,
    truncate_expand_to: Option<u64>,
    settling: BTreeMap<String, u32>,
    grants: Vec<(String, String)>,
    calls: CallCounts,
}

/// In-memory [`ResourceApi`] with scripted job progress.
///
/// Jobs report pending for the configured number of polls, then apply their
/// effect and report success (or the scripted failure).
#[derive(Clone, Debug)]
pub struct FakeResourceApi {
    kind: ResourceKind,
    state: Arc<Mutex<ResourceState>>,
}

impl FakeResourceApi {
    /// Creates an empty fake for `kind`.
    #[must_use]
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(ResourceState::default())),
        }
    }

    /// Seeds an existing resource.
    pub fn insert(&self, resource: Resource) {
        lock(&self.state)
            .resources
            .insert(resource.id.clone(), resource);
    }

    /// Number of pending polls each subsequent job reports before finishing.
    pub fn set_pending_polls(&self, polls: u32) {
        lock(&self.state).pending_polls = polls;
    }

    /// Makes the next submitted job fail with `reason`.
    pub fn fail_next_job(&self, reason: impl Into<String>) {
        lock(&self.state).fail_next_job = Some(reason.into());
    }

    /// Makes expand jobs settle at `size_gb` regardless of the request.
    pub fn truncate_expansions_to(&self, size_gb: u64) {
        lock(&self.state).truncate_expand_to = Some(size_gb);
    }

    /// Makes the seeded resource `id` keep its current status for `lookups`
    /// more `get` calls, then become available.
    pub fn settle_after(&self, id: impl Into<String>, lookups: u32) {
        lock(&self.state).settling.insert(id.into(), lookups);
    }

    /// Returns the stored resource with `id`.
    #[must_use]
    pub fn resource(&self, id: &str) -> Option<Resource> {
        lock(&self.state).resources.get(id).cloned()
    }

    /// Number of stored resources.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.state).resources.len()
    }

    /// Returns `true` when no resources are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls observed so far.
    #[must_use]
    pub fn calls(&self) -> CallCounts {
        lock(&self.state).calls
    }

    /// `(resource id, network id)` pairs passed to `grant_access`.
    #[must_use]
    pub fn grants(&self) -> Vec<(String, String)> {
        lock(&self.state).grants.clone()
    }

    const fn create_kind(&self) -> JobKind {
        match self.kind {
            ResourceKind::Block => JobKind::Compute,
            ResourceKind::Share => JobKind::ShareCreate,
            ResourceKind::TurboShare => JobKind::TurboCreate,
        }
    }

    const fn settled_status(&self) -> &'static str {
        let kind = match self.kind {
            ResourceKind::Block => JobKind::VolumeCreate,
            ResourceKind::Share => JobKind::ShareCreate,
            ResourceKind::TurboShare => JobKind::TurboCreate,
        };
        scripted_status(kind, JobState::Success)
    }

    const fn expand_kind(&self) -> JobKind {
        match self.kind {
            ResourceKind::Block => JobKind::Compute,
            ResourceKind::Share => JobKind::ShareExtend,
            ResourceKind::TurboShare => JobKind::TurboExtend,
        }
    }

    fn submit(state: &mut ResourceState, kind: JobKind, entity: String, effect: JobEffect) -> JobHandle {
        state.next_id = state.next_id.saturating_add(1);
        let job_id = format!("job-{}", state.next_id);
        let job = FakeJob {
            kind,
            entity,
            pending_left: state.pending_polls,
            failure: state.fail_next_job.take(),
            effect: Some(effect),
        };
        state.jobs.insert(job_id.clone(), job);
        JobHandle::new(job_id, kind)
    }

    fn do_create(&self, spec: &CreateSpec) -> Result<JobHandle, CloudError> {
        let mut state = lock(&self.state);
        state.calls.create = state.calls.create.saturating_add(1);
        let id = format!("{}-{}", self.kind, state.next_id.saturating_add(1));
        let mut resource = Resource::new(id.clone(), spec.name.clone(), self.kind, spec.size_gb);
        resource.source.clone_from(&spec.source);
        resource.volume_type.clone_from(&spec.volume_type);
        resource.share_proto.clone_from(&spec.share_proto);
        resource.metadata.clone_from(&spec.metadata);
        if self.kind != ResourceKind::Block {
            resource.export_location = Some(format!("10.0.0.1:/{id}"));
        }
        let kind = self.create_kind();
        Ok(Self::submit(&mut state, kind, id, JobEffect::Create(resource)))
    }

    fn do_get(&self, id: &str) -> Result<Resource, CloudError> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let finished = match state.settling.get_mut(id) {
            Some(left) if *left == 0 => true,
            Some(left) => {
                *left -= 1;
                false
            }
            None => false,
        };
        if finished {
            state.settling.remove(id);
            if let Some(resource) = state.resources.get_mut(id) {
                resource.status = self.settled_status().to_owned();
                if self.kind != ResourceKind::Block && resource.export_location.is_none() {
                    resource.export_location = Some(format!("10.0.0.1:/{id}"));
                }
            }
        }
        state
            .resources
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("resource", id))
    }

    fn do_job_status(&self, job: &JobHandle) -> Result<JobSnapshot, CloudError> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        state.calls.job_status = state.calls.job_status.saturating_add(1);
        let Some(fake) = state.jobs.get_mut(&job.id) else {
            return Err(not_found("job", &job.id));
        };
        if fake.pending_left > 0 {
            fake.pending_left -= 1;
            return Ok(JobSnapshot {
                status: scripted_status(fake.kind, JobState::Pending).to_owned(),
                entity: None,
                reason: None,
            });
        }
        if let Some(reason) = fake.failure.clone() {
            return Ok(JobSnapshot {
                status: scripted_status(fake.kind, JobState::Failure).to_owned(),
                entity: None,
                reason: Some(reason),
            });
        }
        let kind = fake.kind;
        let entity = fake.entity.clone();
        match fake.effect.take() {
            Some(JobEffect::Create(resource)) => {
                state.resources.insert(resource.id.clone(), resource);
            }
            Some(JobEffect::Expand { id, size_gb }) => {
                let settled = state.truncate_expand_to.unwrap_or(size_gb);
                if let Some(resource) = state.resources.get_mut(&id) {
                    resource.size_gb = settled;
                }
            }
            Some(JobEffect::Delete { id }) => {
                state.resources.remove(&id);
            }
            None => {}
        }
        Ok(JobSnapshot {
            status: scripted_status(kind, JobState::Success).to_owned(),
            entity: Some(entity),
            reason: None,
        })
    }

    fn do_delete(&self, id: &str) -> Result<Option<JobHandle>, CloudError> {
        let mut state = lock(&self.state);
        state.calls.delete = state.calls.delete.saturating_add(1);
        if !state.resources.contains_key(id) {
            return Err(not_found("resource", id));
        }
        if self.kind == ResourceKind::Block {
            let effect = JobEffect::Delete { id: id.to_owned() };
            return Ok(Some(Self::submit(&mut state, JobKind::Compute, id.to_owned(), effect)));
        }
        state.resources.remove(id);
        Ok(None)
    }

    fn do_expand(&self, id: &str, new_size_gb: u64) -> Result<JobHandle, CloudError> {
        let mut state = lock(&self.state);
        state.calls.expand = state.calls.expand.saturating_add(1);
        if !state.resources.contains_key(id) {
            return Err(not_found("resource", id));
        }
        let effect = JobEffect::Expand {
            id: id.to_owned(),
            size_gb: new_size_gb,
        };
        let kind = self.expand_kind();
        Ok(Self::submit(&mut state, kind, id.to_owned(), effect))
    }
}

impl ResourceApi for FakeResourceApi {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn list_by_name<'a>(&'a self, name: &'a str) -> CloudFuture<'a, Vec<Resource>> {
        let mut state = lock(&self.state);
        state.calls.list = state.calls.list.saturating_add(1);
        // Mimics providers that filter by substring.
        let found: Vec<Resource> = state
            .resources
            .values()
            .filter(|resource| resource.name.contains(name))
            .cloned()
            .collect();
        drop(state);
        ready(Ok(found))
    }

    fn create<'a>(&'a self, spec: &'a CreateSpec) -> CloudFuture<'a, JobHandle> {
        ready(self.do_create(spec))
    }

    fn job_status<'a>(&'a self, job: &'a JobHandle) -> CloudFuture<'a, JobSnapshot> {
        ready(self.do_job_status(job))
    }

    fn get<'a>(&'a self, id: &'a str) -> CloudFuture<'a, Resource> {
        ready(self.do_get(id))
    }

    fn delete<'a>(&'a self, id: &'a str) -> CloudFuture<'a, Option<JobHandle>> {
        ready(self.do_delete(id))
    }

    fn expand<'a>(&'a self, id: &'a str, new_size_gb: u64) -> CloudFuture<'a, JobHandle> {
        ready(self.do_expand(id, new_size_gb))
    }

    fn grant_access<'a>(&'a self, id: &'a str, network_id: &'a str) -> CloudFuture<'a, ()> {
        let mut state = lock(&self.state);
        state.calls.grant_access = state.calls.grant_access.saturating_add(1);
        state.grants.push((id.to_owned(), network_id.to_owned()));
        drop(state);
        ready(Ok(()))
    }
}

#[derive(Debug, Default)]
struct InstanceState {
    attachments: BTreeMap<(String, String), Option<String>>,
    jobs: BTreeMap<String, (String, String, bool)>,
    next_id: u32,
    device_on_attach: Option<String>,
    attach_calls: usize,
    detach_calls: usize,
}

/// In-memory [`InstanceApi`]; jobs complete on their first poll.
#[derive(Clone, Debug, Default)]
pub struct FakeInstanceApi {
    state: Arc<Mutex<InstanceState>>,
}

impl FakeInstanceApi {
    /// Creates a fake with no attachments.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Device path reported for attachments created from now on.
    pub fn set_device_on_attach(&self, device: Option<&str>) {
        lock(&self.state).device_on_attach = device.map(str::to_owned);
    }

    /// Seeds an existing attachment.
    pub fn insert_attachment(&self, instance_id: &str, volume_id: &str, device: Option<&str>) {
        lock(&self.state).attachments.insert(
            (instance_id.to_owned(), volume_id.to_owned()),
            device.map(str::to_owned),
        );
    }

    /// Returns `true` when the pair is attached.
    #[must_use]
    pub fn is_attached(&self, instance_id: &str, volume_id: &str) -> bool {
        lock(&self.state)
            .attachments
            .contains_key(&(instance_id.to_owned(), volume_id.to_owned()))
    }

    /// `(attach, detach)` call counts.
    #[must_use]
    pub fn calls(&self) -> (usize, usize) {
        let state = lock(&self.state);
        (state.attach_calls, state.detach_calls)
    }

    fn submit(&self, instance_id: &str, volume_id: &str, attach: bool) -> JobHandle {
        let mut state = lock(&self.state);
        if attach {
            state.attach_calls = state.attach_calls.saturating_add(1);
        } else {
            state.detach_calls = state.detach_calls.saturating_add(1);
        }
        state.next_id = state.next_id.saturating_add(1);
        let job_id = format!("attach-job-{}", state.next_id);
        state.jobs.insert(
            job_id.clone(),
            (instance_id.to_owned(), volume_id.to_owned(), attach),
        );
        JobHandle::new(job_id, JobKind::Compute)
    }

    fn finish(&self, job: &JobHandle) -> Result<JobSnapshot, CloudError> {
        let mut state = lock(&self.state);
        let Some((instance_id, volume_id, attach)) = state.jobs.remove(&job.id) else {
            return Err(not_found("job", &job.id));
        };
        let key = (instance_id, volume_id.clone());
        if attach {
            let device = state.device_on_attach.clone();
            state.attachments.insert(key, device);
        } else {
            state.attachments.remove(&key);
        }
        Ok(JobSnapshot {
            status: scripted_status(JobKind::Compute, JobState::Success).to_owned(),
            entity: Some(volume_id),
            reason: None,
        })
    }
}

impl InstanceApi for FakeInstanceApi {
    fn attach<'a>(
        &'a self,
        instance_id: &'a str,
        volume_id: &'a str,
    ) -> CloudFuture<'a, JobHandle> {
        ready(Ok(self.submit(instance_id, volume_id, true)))
    }

    fn detach<'a>(
        &'a self,
        instance_id: &'a str,
        volume_id: &'a str,
    ) -> CloudFuture<'a, JobHandle> {
        ready(Ok(self.submit(instance_id, volume_id, false)))
    }

    fn job_status<'a>(&'a self, job: &'a JobHandle) -> CloudFuture<'a, JobSnapshot> {
        ready(self.finish(job))
    }

    fn attachment<'a>(
        &'a self,
        instance_id: &'a str,
        volume_id: &'a str,
    ) -> CloudFuture<'a, Option<Attachment>> {
        let found = lock(&self.state)
            .attachments
            .get(&(instance_id.to_owned(), volume_id.to_owned()))
            .map(|device| Attachment {
                instance_id: instance_id.to_owned(),
                device: device.clone(),
            });
        ready(Ok(found))
    }
}

/// [`MetadataApi`] answering from a fixed map of volume ids to devices.
#[derive(Clone, Debug, Default)]
pub struct FakeMetadataApi {
    devices: BTreeMap<String, String>,
}

impl FakeMetadataApi {
    /// Creates a fake that knows `devices`.
    #[must_use]
    pub fn new(devices: &[(&str, &str)]) -> Self {
        Self {
            devices: devices
                .iter()
                .map(|(volume, device)| ((*volume).to_owned(), (*device).to_owned()))
                .collect(),
        }
    }
}

impl MetadataApi for FakeMetadataApi {
    fn device_for<'a>(&'a self, volume_id: &'a str) -> CloudFuture<'a, Option<String>> {
        ready(Ok(self.devices.get(volume_id).cloned()))
    }
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
/// When the script runs dry every further command succeeds silently.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len().saturating_add(1));
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a specific exit code with empty output.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }

    fn next(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, SpawnError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        Ok(lock(&self.responses)
            .pop_front()
            .unwrap_or_else(|| CommandOutput {
                code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            }))
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> ExecFuture<'a> {
        let result = self.next(program, args);
        Box::pin(async move { result })
    }
}
