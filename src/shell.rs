//! Entrypoint script generator.
//!
//! Synthesizes the bash script that runs inside the builder container:
//! git checkout, cache restore, dependency downloads, the job's own steps,
//! artifact upload and cache save. The script is mounted into the pod via
//! the entrypoint ConfigMap and is the only thing the container executes.

use crate::protocol::spec::{JobArtifact, JobCache, JobDependency, JobSpec, JobStep};
use std::fmt::Write;

/// If this variable is set the runner clones from the cache url instead of
/// hitting the origin server directly
pub const VAR_GIT_CACHE_URL: &str = "SFS_GIT_CACHE_URL";

/// `GIT_STRATEGY=none` skips all git operations in the generated script
pub const VAR_GIT_STRATEGY: &str = "GIT_STRATEGY";

const DEFAULT_UPLOAD_NAME: &str = "artifacts";

#[derive(Default)]
struct ScriptContext {
    out: String,
}

/// Generate the job entrypoint script.
pub fn generate_script(spec: &JobSpec, cache_bucket: &str) -> String {
    let mut ctx = ScriptContext::default();

    ctx.prelude(&spec.job_info.name);

    if spec.variable(VAR_GIT_STRATEGY) == Some("none") {
        ctx.line("echo 'Skipping GIT checkout. GIT_STRATEGY = none'");
    } else {
        ctx.git_clone(spec.variable(VAR_GIT_CACHE_URL));
        ctx.git_clean_reset();
        ctx.git_checkout();
    }

    if !cache_bucket.is_empty() {
        for cache in spec.cache.iter().filter(|c| c.pulls()) {
            ctx.cache_pull(cache, spec.job_info.project_id, cache_bucket);
        }
    }

    for dep in &spec.dependencies {
        ctx.download_dependency(dep);
    }

    for step in &spec.steps {
        ctx.job_step(step);
    }

    for artifact in &spec.artifacts {
        ctx.upload_artifact(artifact, spec.id, &spec.token);
    }

    if !cache_bucket.is_empty() {
        for cache in spec.cache.iter().filter(|c| c.pushes()) {
            ctx.cache_push(cache, spec.job_info.project_id, cache_bucket);
        }
    }

    ctx.out
}

impl ScriptContext {
    fn line(&mut self, text: &str) {
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn fline(&mut self, args: std::fmt::Arguments) {
        let _ = self.out.write_fmt(args);
        self.out.push('\n');
    }

    fn lines(&mut self, lines: &[&str]) {
        for l in lines {
            self.line(l);
        }
    }

    fn prelude(&mut self, job_name: &str) {
        self.lines(&["#!/usr/bin/env bash", "set -euxo"]);

        let wdir = format!("/build/{job_name}");
        self.fline(format_args!("mkdir -p '{wdir}'"));
        self.fline(format_args!("cd '{wdir}'"));
        self.line("pwd");
    }

    fn git_clone(&mut self, cache_url: Option<&str>) {
        self.line("echo 'Fetching git remotes'");

        match cache_url {
            Some(_) => {
                // clone from the cache remote, then point origin back at the
                // real repository before fetching the refs we build
                self.fline(format_args!("git clone ${{{VAR_GIT_CACHE_URL}}} ./"));
                self.line("git remote set-url origin ${CI_REPOSITORY_URL}");
            }
            None => self.line("git clone ${CI_REPOSITORY_URL} ./"),
        }

        self.lines(&[
            "git config fetch.recurseSubmodules false",
            "git fetch --prune",
        ]);
    }

    fn git_clean_reset(&mut self) {
        self.lines(&[
            "rm -f '.git/index.lock'",
            "rm -f '.git/shallow.lock'",
            "rm -f '.git/HEAD.lock'",
            "rm -f '.git/hooks/post-checkout'",
            "git clean -ffdx",
            "git reset --hard",
        ]);
    }

    fn git_checkout(&mut self) {
        self.lines(&[
            "echo \"Checking out ${CI_COMMIT_SHA}\"",
            "git checkout -f -q ${CI_COMMIT_SHA}",
        ]);
    }

    fn cache_pull(&mut self, cache: &JobCache, project_id: i64, bucket: &str) {
        let remote = cache_object_url(bucket, project_id, &cache.key);
        self.fline(format_args!("echo 'Restoring cache {}'", cache.key));
        self.fline(format_args!(
            "(gsutil -q cp '{remote}' - | tar -xz) || echo 'cache miss for {}'",
            cache.key
        ));
    }

    fn cache_push(&mut self, cache: &JobCache, project_id: i64, bucket: &str) {
        let remote = cache_object_url(bucket, project_id, &cache.key);
        let paths = cache.paths.join(" ");
        self.fline(format_args!("echo 'Saving cache {}'", cache.key));
        self.fline(format_args!(
            "(tar -cz {paths} | gsutil -q cp - '{remote}') || echo 'cache push failed for {}'",
            cache.key
        ));
    }

    fn job_step(&mut self, step: &JobStep) {
        self.fline(format_args!(
            "echo 'Step `{}` has {} commands'",
            step.name,
            step.script.len()
        ));
        for command in &step.script {
            self.line(command);
        }
    }

    fn upload_artifact(&mut self, artifact: &JobArtifact, job_id: i64, job_token: &str) {
        self.line("TMPDIR=$(mktemp -d)");

        let in_files = artifact.paths.join(" ");
        let zip_file = format!("${{TMPDIR}}/{DEFAULT_UPLOAD_NAME}.zip");
        self.fline(format_args!("zip -p {zip_file} {in_files}"));

        let mut query = String::new();
        if !artifact.expire_in.is_empty() {
            query = url::form_urlencoded::Serializer::new(String::new())
                .append_pair("expire_in", &artifact.expire_in)
                .finish();
        }
        let post_url = format!("${{CI_API_V4_URL}}/jobs/{job_id}/artifacts?{query}");
        self.fline(format_args!(
            "curl -H \"JOB-TOKEN: {job_token}\" -F \"file=@{zip_file}\" {post_url}"
        ));

        self.lines(&["(rm -rf ${TMPDIR}) || true", "unset TMPDIR"]);
    }

    fn download_dependency(&mut self, dep: &JobDependency) {
        self.line("TMPDIR=$(mktemp -d)");

        let dl_file = format!("${{TMPDIR}}/{DEFAULT_UPLOAD_NAME}.zip");
        let get_url = format!("${{CI_API_V4_URL}}/jobs/{}/artifacts", dep.id);
        self.fline(format_args!(
            "curl -H \"JOB-TOKEN: {}\" --output \"{dl_file}\" {get_url}",
            dep.token
        ));
        self.fline(format_args!("unzip -o {dl_file}"));

        self.lines(&["(rm -rf ${TMPDIR}) || true", "unset TMPDIR"]);
    }
}

fn cache_object_url(bucket: &str, project_id: i64, key: &str) -> String {
    format!("gs://{bucket}/cache/{project_id}/{key}.tar.gz")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::spec::{JobInfo, JobVariable};

    fn base_spec() -> JobSpec {
        JobSpec {
            id: 42,
            token: "jobtok".to_string(),
            job_info: JobInfo {
                name: "compile".to_string(),
                project_id: 7,
                ..JobInfo::default()
            },
            steps: vec![JobStep {
                name: "build".to_string(),
                script: vec!["make".to_string(), "make test".to_string()],
                timeout_seconds: 600,
                when: "on_success".to_string(),
                allow_failure: false,
            }],
            ..JobSpec::default()
        }
    }

    fn with_variable(mut spec: JobSpec, key: &str, value: &str) -> JobSpec {
        spec.variables.push(JobVariable {
            key: key.to_string(),
            value: value.to_string(),
            public: true,
            masked: false,
        });
        spec
    }

    #[test]
    fn test_prelude_and_steps() {
        let script = generate_script(&base_spec(), "");

        assert!(script.starts_with("#!/usr/bin/env bash\nset -euxo\n"));
        assert!(script.contains("mkdir -p '/build/compile'"));
        assert!(script.contains("echo 'Step `build` has 2 commands'"));
        assert!(script.contains("\nmake\nmake test\n"));
        assert!(script.contains("git clone ${CI_REPOSITORY_URL} ./"));
        assert!(script.contains("git checkout -f -q ${CI_COMMIT_SHA}"));
    }

    #[test]
    fn test_git_strategy_none_skips_checkout() {
        let spec = with_variable(base_spec(), VAR_GIT_STRATEGY, "none");
        let script = generate_script(&spec, "");

        assert!(script.contains("Skipping GIT checkout"));
        assert!(!script.contains("git clone"));
        assert!(!script.contains("git checkout"));
    }

    #[test]
    fn test_git_cache_url_repoints_origin() {
        let spec = with_variable(base_spec(), VAR_GIT_CACHE_URL, "https://cache/git/widget");
        let script = generate_script(&spec, "");

        assert!(script.contains("git clone ${SFS_GIT_CACHE_URL} ./"));
        assert!(script.contains("git remote set-url origin ${CI_REPOSITORY_URL}"));
        assert!(script.contains("git fetch --prune"));
    }

    #[test]
    fn test_cache_policies() {
        let mut spec = base_spec();
        spec.cache = vec![
            JobCache {
                key: "cargo".to_string(),
                paths: vec![".cargo".to_string()],
                policy: "pull".to_string(),
            },
            JobCache {
                key: "target".to_string(),
                paths: vec!["target".to_string()],
                policy: "push".to_string(),
            },
        ];
        let script = generate_script(&spec, "ci-cache");

        assert!(script.contains("gs://ci-cache/cache/7/cargo.tar.gz"));
        assert!(script.contains("Restoring cache cargo"));
        assert!(!script.contains("Saving cache cargo"));
        assert!(script.contains("Saving cache target"));
        assert!(!script.contains("Restoring cache target"));
    }

    #[test]
    fn test_no_bucket_no_cache_lines() {
        let mut spec = base_spec();
        spec.cache = vec![JobCache {
            key: "cargo".to_string(),
            paths: vec![".cargo".to_string()],
            policy: "pull-push".to_string(),
        }];
        let script = generate_script(&spec, "");

        assert!(!script.contains("gsutil"));
    }

    #[test]
    fn test_artifact_upload_and_dependency_download() {
        let mut spec = base_spec();
        spec.artifacts = vec![JobArtifact {
            paths: vec!["target/release".to_string()],
            when: "on_success".to_string(),
            expire_in: "1 week".to_string(),
        }];
        spec.dependencies = vec![JobDependency {
            id: 41,
            name: "compile".to_string(),
            token: "deptok".to_string(),
        }];
        let script = generate_script(&spec, "");

        assert!(script.contains("zip -p ${TMPDIR}/artifacts.zip target/release"));
        assert!(script.contains("jobs/42/artifacts?expire_in=1+week"));
        assert!(script.contains("JOB-TOKEN: jobtok"));
        assert!(script.contains("--output \"${TMPDIR}/artifacts.zip\" ${CI_API_V4_URL}/jobs/41/artifacts"));
        assert!(script.contains("JOB-TOKEN: deptok"));
        assert!(script.contains("unzip -o ${TMPDIR}/artifacts.zip"));
    }
}
