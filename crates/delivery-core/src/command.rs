//! Command-line construction for build and deploy tooling.
//!
//! Pure functions from startup parameters to an executable plus arguments.
//! Nothing here spawns processes.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// An executable and its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Wrap a free-form command string for `sh -c`.
    pub fn shell(command: &str) -> Self {
        Self::new("sh").arg("-c").arg(command)
    }

    /// Human-readable rendering for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Parameters a deployed application is started with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupInfo {
    pub port: u16,
    /// Path prefix the application serves under, e.g. `/owner/repo/branch`.
    pub context_root: String,
    /// Team or tenant the deployment belongs to.
    pub team: String,
}

impl StartupInfo {
    /// JVM system properties passed to Spring Boot.
    pub fn system_properties(&self) -> Vec<String> {
        vec![
            format!("-Dserver.port={}", self.port),
            format!("-Dserver.servlet.context-path={}", self.context_root),
            format!("-Ddelivery.team={}", self.team),
        ]
    }
}

/// `mvn package -DskipTests`
pub fn maven_package() -> CommandLine {
    CommandLine::new("mvn").args(["package", "-DskipTests"])
}

/// `npm install` followed by `npm run build`, as one shell invocation.
pub fn npm_build() -> CommandLine {
    CommandLine::shell("npm install && npm run build")
}

/// Run a Spring Boot project from source.
pub fn spring_boot_run(info: &StartupInfo) -> CommandLine {
    let jvm_args = info.system_properties().join(" ");
    CommandLine::new("mvn")
        .arg("spring-boot:run")
        .arg(format!("-Dspring-boot.run.jvmArguments={jvm_args}"))
}

/// Run a packaged executable jar.
pub fn executable_jar(info: &StartupInfo, jar: &Path) -> CommandLine {
    CommandLine::new("java")
        .args(info.system_properties())
        .arg("-jar")
        .arg(jar.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn info() -> StartupInfo {
        StartupInfo {
            port: 8082,
            context_root: "/acme/shop/master".to_string(),
            team: "T123".to_string(),
        }
    }

    #[test]
    fn maven_package_skips_tests() {
        assert_eq!(maven_package().display(), "mvn package -DskipTests");
    }

    #[test]
    fn spring_boot_run_passes_port_and_context_root() {
        let cmd = spring_boot_run(&info());
        assert_eq!(cmd.program, "mvn");
        assert_eq!(cmd.args[0], "spring-boot:run");
        assert!(cmd.args[1].contains("-Dserver.port=8082"));
        assert!(cmd.args[1].contains("-Dserver.servlet.context-path=/acme/shop/master"));
    }

    #[test]
    fn executable_jar_puts_properties_before_jar() {
        let cmd = executable_jar(&info(), &PathBuf::from("/tmp/app.jar"));
        assert_eq!(cmd.program, "java");
        let jar_pos = cmd.args.iter().position(|a| a == "-jar").unwrap();
        assert_eq!(cmd.args[jar_pos + 1], "/tmp/app.jar");
        assert!(cmd.args[..jar_pos].contains(&"-Dserver.port=8082".to_string()));
    }

    #[test]
    fn shell_wraps_command() {
        let cmd = CommandLine::shell("echo hi");
        assert_eq!(cmd.args, vec!["-c".to_string(), "echo hi".to_string()]);
    }
}
