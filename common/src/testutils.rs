#[cfg(test)]
pub async fn create_temp_dir() -> anyhow::Result<std::path::PathBuf> {
    let mut idx = 0;
    loop {
        let tmp_dir = std::env::temp_dir().join(format!("rcache_test{}", &idx));
        if let Err(error) = tokio::fs::create_dir(&tmp_dir).await {
            match error.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    idx += 1;
                }
                _ => return Err(error.into()),
            }
        } else {
            return Ok(tmp_dir);
        }
    }
}

#[cfg(test)]
pub async fn setup_source_tree() -> anyhow::Result<std::path::PathBuf> {
    // create a temporary directory
    let tmp_dir = create_temp_dir().await?;
    // source
    // |- a.bin (5 bytes)
    // |- sub
    //    |- b.bin (10 bytes)
    //    |- c.bin (20 bytes)
    let source = tmp_dir.join("source");
    tokio::fs::create_dir(&source).await.unwrap();
    tokio::fs::write(source.join("a.bin"), "aaaaa").await.unwrap();
    let sub = source.join("sub");
    tokio::fs::create_dir(&sub).await.unwrap();
    tokio::fs::write(sub.join("b.bin"), "b".repeat(10)).await.unwrap();
    tokio::fs::write(sub.join("c.bin"), "c".repeat(20)).await.unwrap();
    Ok(tmp_dir)
}

/// Writes a `/bin/sh` script standing in for the mirroring tool. The script sees the source and
/// destination as `$1` and `$2`, followed by the mode flags.
#[cfg(test)]
pub async fn fake_tool(dir: &std::path::Path, body: &str) -> anyhow::Result<crate::ToolConfig> {
    let mut idx = 0;
    let script = loop {
        let candidate = dir.join(format!("fake_tool{}.sh", idx));
        if !candidate.exists() {
            break candidate;
        }
        idx += 1;
    };
    tokio::fs::write(&script, format!("#!/bin/sh\n{}\n", body)).await?;
    Ok(crate::ToolConfig {
        program: "/bin/sh".into(),
        pre_args: vec![script.to_string_lossy().to_string()],
        ..Default::default()
    })
}
