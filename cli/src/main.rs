//! Command line arguments.
use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use devsugar::{
    Repo,
    iap::{self, ComputeBackendServices, IapAppPolicy, IapPolicyClient, ServiceRef},
    jwt,
    oauthutil::{
        CachedOidcLogin, ClientCredentials, Proxy, StaticTokenSource, Token, TokenSource,
        WebFlowTimeouts, proxy::bind_loopback,
    },
    util::pretty_string,
};
use n0_error::{Result, StackResultExt, StdResultExt};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Developer tools for logging in with OIDC and working with IAP.
#[derive(Parser, Debug)]
struct Args {
    #[clap(short, long, env = "DEVSUGAR_REPO")]
    repo: Option<PathBuf>,
    /// Log filter, e.g. `info` or `devsugar=debug`. `RUST_LOG` takes precedence.
    #[clap(long, default_value = "info")]
    level: String,
    /// Log as JSON.
    #[clap(long)]
    json_logs: bool,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log in and manage cached credentials.
    #[clap(subcommand)]
    Auth(AuthCommands),

    /// Run a local proxy that adds IAP style identity headers to requests.
    Proxy(ProxyArgs),

    /// Inspect JWTs.
    #[clap(subcommand)]
    Jwts(JwtsCommands),

    /// Work with Identity-Aware Proxy resources.
    #[clap(subcommand)]
    Iap(IapCommands),

    /// Manage kubectl configuration.
    #[clap(subcommand)]
    Kubectl(KubectlCommands),
}

#[derive(Subcommand, Debug)]
enum AuthCommands {
    /// Log in through the browser unless a cached login is still usable.
    Login(LoginArgs),
    /// Print a verified ID token, e.g. for `Authorization: Bearer` headers.
    Token(LoginArgs),
}

#[derive(Parser, Debug)]
struct LoginArgs {
    /// How long to wait for the browser to complete the login.
    #[clap(long, default_value = "3m", value_parser = humantime::parse_duration)]
    timeout: Duration,
}

#[derive(Parser, Debug)]
struct ProxyArgs {
    /// Port to listen on. Defaults to `proxy.port` from the config.
    #[clap(long)]
    port: Option<u16>,
    /// Where to forward requests. Defaults to `proxy.upstream` from the config.
    #[clap(long)]
    upstream: Option<url::Url>,
}

#[derive(Subcommand, Debug)]
enum JwtsCommands {
    /// Decode a JWT and verify its signature.
    Parse {
        jwt: String,
        /// JWKS to verify the signature with. Empty skips verification.
        #[clap(long, default_value = jwt::GOOGLE_JWKS_URL)]
        jwks: String,
    },
}

#[derive(Parser, Debug)]
struct K8sArgs {
    /// The kubeconfig file to use. Defaults to the standard lookup.
    #[clap(long)]
    kubeconfig: Option<PathBuf>,
    /// The kubeconfig context to use.
    #[clap(long)]
    context: Option<String>,
}

#[derive(Subcommand, Debug)]
enum IapCommands {
    /// Print the IAP resource name of the backend serving a K8s service.
    Backend {
        /// The project ID or number that owns the backend resource.
        #[clap(long)]
        project: String,
        /// The K8s namespace containing the ingress and service.
        #[clap(long)]
        namespace: String,
        /// The K8s service.
        #[clap(long)]
        service: String,
        /// The ingress routing to the service. Without it the backend is
        /// found through the service's NEG.
        #[clap(long)]
        ingress: Option<String>,
        #[clap(flatten)]
        k8s: K8sArgs,
        #[clap(long, env = "GOOGLE_OAUTH_ACCESS_TOKEN", hide_env_values = true)]
        access_token: Option<String>,
    },
    /// Validate an IAPAppPolicy file and print the resource it applies to.
    Resolve {
        /// The YAML file containing the policy.
        #[clap(short, long)]
        file: PathBuf,
        #[clap(flatten)]
        k8s: K8sArgs,
        #[clap(long, env = "GOOGLE_OAUTH_ACCESS_TOKEN", hide_env_values = true)]
        access_token: Option<String>,
    },
    /// Print the IAM policy of the IAP resource serving a K8s service.
    GetIamPolicy {
        /// The project ID or number that owns the backend resource.
        #[clap(long)]
        project: String,
        /// The backend service. Found from the K8s service when not set.
        #[clap(long)]
        backend: Option<String>,
        /// The K8s namespace containing the ingress and service.
        #[clap(long)]
        namespace: Option<String>,
        /// The K8s service to get the policy for.
        #[clap(long)]
        service: Option<String>,
        /// The ingress routing to the service.
        #[clap(long)]
        ingress: Option<String>,
        #[clap(flatten)]
        k8s: K8sArgs,
        #[clap(long, env = "GOOGLE_OAUTH_ACCESS_TOKEN", hide_env_values = true)]
        access_token: Option<String>,
    },
    /// Set the IAM policy of an IAP resource from an IAPAppPolicy file.
    ///
    /// Replaces the existing policy unless --merge is given.
    SetIamPolicy {
        /// The YAML file containing the policy to apply.
        #[clap(short, long)]
        file: PathBuf,
        /// Add the bindings to the current policy instead of replacing it.
        #[clap(long)]
        merge: bool,
        #[clap(flatten)]
        k8s: K8sArgs,
        #[clap(long, env = "GOOGLE_OAUTH_ACCESS_TOKEN", hide_env_values = true)]
        access_token: Option<String>,
    },
    /// Create or update a K8s secret holding the OAuth client.
    CreateSecret {
        /// The name of the secret.
        #[clap(long)]
        name: String,
        /// The namespace of the secret.
        #[clap(long)]
        namespace: String,
        /// The OAuth client file. Defaults to the one in the repo.
        #[clap(long)]
        file: Option<PathBuf>,
        #[clap(flatten)]
        k8s: K8sArgs,
    },
}

#[derive(Subcommand, Debug)]
enum KubectlCommands {
    /// Create a context from the current one with a different namespace.
    CreateContext {
        /// Name of the context. Defaults to the namespace.
        #[clap(short, long)]
        name: Option<String>,
        #[clap(long)]
        namespace: String,
        /// The kubeconfig file to modify. Defaults to the standard location.
        #[clap(long)]
        kubeconfig: Option<PathBuf>,
    },
}

fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .std_context("Invalid log filter")?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

/// Google API calls fail without a token, set GOOGLE_OAUTH_ACCESS_TOKEN
/// (e.g. from `gcloud auth print-access-token`).
fn google_tokens(access_token: Option<String>) -> Arc<dyn TokenSource> {
    let token = Token::new(access_token.unwrap_or_default());
    Arc::new(StaticTokenSource::new(token))
}

fn compute_lister(access_token: Option<String>) -> Result<ComputeBackendServices> {
    ComputeBackendServices::new(google_tokens(access_token))
}

async fn k8s_client(k8s: &K8sArgs) -> Result<kube::Client> {
    devsugar::k8s::client(k8s.kubeconfig.as_deref(), k8s.context.as_deref()).await
}

async fn login(repo: &Repo, timeout: Duration) -> Result<CachedOidcLogin> {
    let config = repo.config().await?;
    let login = config.oidc.login(repo.token_cache()).await?;
    Ok(login.with_timeouts(WebFlowTimeouts {
        completion: timeout,
        ..Default::default()
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.level, args.json_logs)?;
    if let Some(path) = dotenv::dotenv().ok() {
        info!("Loaded environment variables from {}", path.display());
    }

    let path = match args.repo {
        Some(path) => path,
        None => Repo::default_location()?,
    };
    let repo = Repo::open_or_create(path).await?;

    match args.command {
        Commands::Auth(AuthCommands::Login(login_args)) => {
            let source = login(&repo, login_args.timeout).await?.token_source().await?;
            let id_token = source.id_token().await?;
            println!(
                "Logged in as {}",
                id_token.email().unwrap_or(id_token.subject())
            );
        }
        Commands::Auth(AuthCommands::Token(login_args)) => {
            let source = login(&repo, login_args.timeout).await?.token_source().await?;
            println!("{}", source.id_token().await?.raw());
        }
        Commands::Proxy(proxy_args) => {
            let config = repo.config().await?;
            let port = proxy_args.port.unwrap_or(config.proxy.port);
            let upstream = match proxy_args.upstream {
                Some(upstream) => upstream,
                None => url::Url::parse(&config.proxy.upstream)
                    .std_context("Invalid proxy.upstream in config")?,
            };

            let provider = config.oidc.provider().await?;
            let (listener, redirect_url) = bind_loopback(port).await?;
            let addr = listener.local_addr()?;
            let handlers = provider.handlers(redirect_url, config.oidc.scopes);
            let proxy = Proxy::new(handlers, upstream.clone())?;
            println!("Proxying http://{addr} -> {upstream}");

            let shutdown = CancellationToken::new();
            let server = tokio::spawn(proxy.serve(listener, shutdown.clone()));
            tokio::signal::ctrl_c().await?;
            shutdown.cancel();
            server.await.anyerr()??;
        }
        Commands::Jwts(JwtsCommands::Parse { jwt: token, jwks }) => {
            let decoded = if jwks.is_empty() {
                jwt::decode_unverified(&token)?
            } else {
                let http = reqwest_client()?;
                jwt::verify_with_jwks(&token, &jwks, &http).await?
            };
            println!("{}", pretty_string(&decoded));
        }
        Commands::Iap(IapCommands::Backend {
            project,
            namespace,
            service,
            ingress,
            k8s,
            access_token,
        }) => {
            let client = k8s_client(&k8s).await?;
            match ingress {
                Some(ingress) => {
                    let backend = iap::gcp_backend(&client, &namespace, &service, &ingress).await?;
                    println!("{}", iap::backend_iap_name(&project, &backend));
                }
                None => {
                    let lister = compute_lister(access_token)?;
                    let negs = iap::gcp_backend_from_service(
                        &client, &lister, &project, &namespace, &service,
                    )
                    .await?;
                    for (neg, backend) in negs {
                        match backend {
                            Some(backend) => {
                                println!("{neg} -> {}", iap::backend_iap_name(&project, &backend))
                            }
                            None => println!("{neg} -> no backend service"),
                        }
                    }
                }
            }
        }
        Commands::Iap(IapCommands::Resolve {
            file,
            k8s,
            access_token,
        }) => {
            let policy = IapAppPolicy::from_file(&file).await?;
            policy.validate()?;
            let resource = match policy.external() {
                Some(external) => external.to_string(),
                None => {
                    let client = k8s_client(&k8s).await?;
                    let lister = compute_lister(access_token)?;
                    policy.resolve_resource(&client, &lister).await?
                }
            };
            println!("{resource}");
            for binding in &policy.spec.bindings {
                println!("  {}: {}", binding.role, binding.members.join(", "));
            }
        }
        Commands::Iap(IapCommands::GetIamPolicy {
            project,
            backend,
            namespace,
            service,
            ingress,
            k8s,
            access_token,
        }) => {
            let resource = match backend {
                Some(backend) => {
                    if namespace.is_some() && service.is_some() && ingress.is_some() {
                        n0_error::bail_any!(
                            "If --backend is supplied --namespace, --service, and --ingress should not be set"
                        );
                    }
                    iap::backend_iap_name(&project, &backend)
                }
                None => {
                    let (Some(namespace), Some(service)) = (namespace, service) else {
                        n0_error::bail_any!("Either --backend or --namespace and --service are required");
                    };
                    let service_ref = ServiceRef {
                        project,
                        service,
                        ingress: ingress.unwrap_or_default(),
                        namespace,
                    };
                    let client = k8s_client(&k8s).await?;
                    let lister = compute_lister(access_token.clone())?;
                    service_ref.resolve(&client, &lister).await?
                }
            };
            info!(%resource, "getting IAP IAM policy");
            let policy = IapPolicyClient::new(google_tokens(access_token))?
                .get_iam_policy(&resource)
                .await?;
            println!("Policy for {resource}:\n{}", pretty_string(&policy));
        }
        Commands::Iap(IapCommands::SetIamPolicy {
            file,
            merge,
            k8s,
            access_token,
        }) => {
            let policy = IapAppPolicy::from_file(&file).await?;
            policy.validate()?;
            let resource = match policy.external() {
                Some(external) => external.to_string(),
                None => {
                    let client = k8s_client(&k8s).await?;
                    let lister = compute_lister(access_token.clone())?;
                    policy.resolve_resource(&client, &lister).await?
                }
            };
            let updated = IapPolicyClient::new(google_tokens(access_token))?
                .apply_bindings(&resource, &policy.spec.bindings, merge)
                .await?;
            println!("Policy for {resource}:\n{}", pretty_string(&updated));
        }
        Commands::Iap(IapCommands::CreateSecret {
            name,
            namespace,
            file,
            k8s,
        }) => {
            let file = match file {
                Some(file) => file,
                None => repo
                    .config()
                    .await?
                    .oidc
                    .client_file
                    .context("No OAuth client file configured")?,
            };
            let credentials = ClientCredentials::from_file(&file).await?;
            let client = k8s_client(&k8s).await?;
            iap::create_secret(&client, &credentials, &namespace, &name).await?;
            println!("Updated secret {namespace}.{name}");
        }
        Commands::Kubectl(KubectlCommands::CreateContext {
            name,
            namespace,
            kubeconfig,
        }) => {
            let path = devsugar::k8s::kubeconfig_path(kubeconfig.as_deref())?;
            let context = devsugar::k8s::create_context(&path, name.as_deref(), &namespace).await?;
            println!(
                "Created context {}; namespace={namespace} in {}",
                context.name,
                path.display()
            );
        }
    }

    Ok(())
}

fn reqwest_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .std_context("Failed to build HTTP client")
}
