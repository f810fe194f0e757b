use kube::CustomResourceExt;
use pd_operator::crd::ManagedCluster;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&ManagedCluster::crd())?);
    Ok(())
}
