async fn resolve_access_token(
    store: &MetadataStore,
    credentials: &Credentials,
    base_url: Option<&str>,
) -> anyhow::Result<String> {
    if let Some(token) = &credentials.access_token {
        return Ok(token.clone());
    }
    if let Some(token) = store.read_config(ACCESS_TOKEN_KEY).await? {
        return Ok(token);
    }

    let oauth = oauth_client(credentials, base_url)?
        .context("no saved credentials: set DSYNC_APP_KEY and DSYNC_APP_SECRET to sign in")?;
    let url = oauth.authorize_url(None).context("failed to build authorize url")?;
    println!("First run: this app needs access to your Dropbox.");
    println!("1. Open this URL in your browser:\n{url}");
    println!("2. Click \"Allow\" (you might have to log in first).");
    let code = prompt("3. Paste the authorization code here: ").await?;
    authenticate_and_store(store, &oauth, &code).await
}

async fn authenticate_and_store(
    store: &MetadataStore,
    oauth: &OAuthClient,
    code: &str,
) -> anyhow::Result<String> {
    if code.trim().is_empty() {
        anyhow::bail!("no authorization code entered");
    }
    let token = oauth
        .exchange_code(code)
        .await
        .context("failed to exchange authorization code")?;
    store
        .write_config(ACCESS_TOKEN_KEY, &token.access_token)
        .await
        .context("failed to save access token")?;
    info!(account = ?token.account_id, "signed in");
    Ok(token.access_token)
}

fn oauth_client(
    credentials: &Credentials,
    base_url: Option<&str>,
) -> anyhow::Result<Option<OAuthClient>> {
    match (&credentials.app_key, &credentials.app_secret) {
        (Some(key), Some(secret)) => Ok(Some(match base_url {
            Some(url) => OAuthClient::with_base_url(url, key.as_str(), secret.as_str())
                .context("invalid oauth base url/config")?,
            None => OAuthClient::new(key.as_str(), secret.as_str()).context("invalid oauth config")?,
        })),
        _ => Ok(None),
    }
}

fn build_client(base_url: Option<&str>, token: &str) -> anyhow::Result<DropboxClient> {
    let client = match base_url {
        Some(url) => DropboxClient::with_base_url(url, token),
        None => DropboxClient::new(token),
    };
    client.context("failed to build Dropbox client")
}

async fn resolve_local_dir(
    store: &MetadataStore,
    configured: Option<PathBuf>,
) -> anyhow::Result<PathBuf> {
    let dir = match configured {
        Some(dir) => dir,
        None => match store.read_config(LOCAL_DIR_KEY).await? {
            Some(saved) if !saved.trim().is_empty() => PathBuf::from(saved),
            _ => {
                let home = dirs::home_dir().context("home directory is unavailable")?;
                let default = home.join(DEFAULT_SYNC_DIR_NAME);
                let answer =
                    prompt(&format!("Local folder to use for Dropbox [{}]: ", default.display()))
                        .await?;
                choose_local_dir(&answer, &home, default)
            }
        },
    };
    if !dir.is_absolute() {
        anyhow::bail!("local folder must be an absolute path: {}", dir.display());
    }
    let value = dir
        .to_str()
        .with_context(|| format!("local folder is not valid UTF-8: {dir:?}"))?;
    store
        .write_config(LOCAL_DIR_KEY, value)
        .await
        .context("failed to save local folder")?;
    Ok(dir)
}

fn choose_local_dir(answer: &str, home: &Path, default: PathBuf) -> PathBuf {
    let answer = answer.trim();
    if answer.is_empty() {
        default
    } else {
        expand_with_home(answer, home)
    }
}

async fn greet(client: &DropboxClient) -> anyhow::Result<()> {
    let account = client
        .get_current_account()
        .await
        .context("failed to fetch account info")?;
    println!("Hello, {}", account.name.display_name);
    match client.get_space_usage().await {
        Ok(usage) => println!(
            "Used storage {} of {}",
            human_readable_bytes(usage.used),
            human_readable_bytes(usage.allocation.allocated)
        ),
        Err(err) => warn!("failed to fetch space usage: {err}"),
    }
    Ok(())
}

/// Records the whole remote tree page by page, persisting the cursor after
/// each page so an interrupted listing resumes where it stopped.
async fn initial_sync(remote: &dyn RemoteStore, store: &MetadataStore) -> anyhow::Result<String> {
    info!("no cursor saved, listing the remote tree");
    let mut page = remote
        .list_folder("", true)
        .await
        .context("failed to list remote folder")?;
    let mut recorded = 0;
    loop {
        recorded += store.write_batch(&page.entries).await?;
        store.set_cursor(&page.cursor).await?;
        if !page.has_more {
            break;
        }
        page = remote
            .list_changes(&page.cursor)
            .await
            .context("failed to continue remote listing")?;
    }
    info!(entries = recorded, "remote tree recorded");
    Ok(page.cursor)
}

fn human_readable_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut exp = 0;
    while value >= UNIT as f64 && exp < 6 {
        value /= UNIT as f64;
        exp += 1;
    }
    let prefix = ['K', 'M', 'G', 'T', 'P', 'E'][exp - 1];
    format!("{value:.2} {prefix}iB")
}

async fn prompt(message: &str) -> anyhow::Result<String> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(message.as_bytes()).await?;
    stdout.flush().await?;
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("failed to read from stdin")?;
    Ok(line.trim().to_string())
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_usize_env(name: &str, default: usize) -> usize {
    usize::try_from(read_u64_env(name, default as u64)).unwrap_or(default)
}
