//! Minimal Maven POM identification.
//!
//! Only pulls out the project's own coordinates; the `<parent>` block and
//! dependency coordinates are ignored.

use regex::Regex;

/// Maven coordinates of a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PomIdentity {
    pub group: Option<String>,
    pub artifact: String,
    pub version: String,
}

impl PomIdentity {
    /// File name `mvn package` produces for a jar project.
    pub fn jar_name(&self) -> String {
        format!("{}-{}.jar", self.artifact, self.version)
    }
}

/// Extract project coordinates from POM XML.
///
/// Returns `None` when either `artifactId` or `version` is missing.
pub fn identify(content: &str) -> Option<PomIdentity> {
    let nested = Regex::new(r"(?s)<(parent|dependencies|dependencyManagement|build|plugins|profiles)>.*?</(parent|dependencies|dependencyManagement|build|plugins|profiles)>").ok()?;
    let stripped = nested.replace_all(content, "");

    let element = |name: &str| -> Option<String> {
        let re = Regex::new(&format!(r"<{name}>\s*([^<]+?)\s*</{name}>")).ok()?;
        re.captures(&stripped)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    };

    Some(PomIdentity {
        group: element("groupId"),
        artifact: element("artifactId")?,
        version: element("version")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const POM: &str = r"<?xml version='1.0'?>
<project>
    <modelVersion>4.0.0</modelVersion>
    <parent>
        <groupId>org.springframework.boot</groupId>
        <artifactId>spring-boot-starter-parent</artifactId>
        <version>3.2.0</version>
    </parent>
    <groupId>com.acme</groupId>
    <artifactId>shop</artifactId>
    <version>0.1.0-SNAPSHOT</version>
    <dependencies>
        <dependency>
            <artifactId>spring-boot-starter-web</artifactId>
            <version>9.9.9</version>
        </dependency>
    </dependencies>
</project>";

    #[test]
    fn identifies_project_not_parent() {
        let id = identify(POM).unwrap();
        assert_eq!(id.group.as_deref(), Some("com.acme"));
        assert_eq!(id.artifact, "shop");
        assert_eq!(id.version, "0.1.0-SNAPSHOT");
        assert_eq!(id.jar_name(), "shop-0.1.0-SNAPSHOT.jar");
    }

    #[test]
    fn missing_version_yields_none() {
        assert_eq!(identify("<project><artifactId>x</artifactId></project>"), None);
    }
}
