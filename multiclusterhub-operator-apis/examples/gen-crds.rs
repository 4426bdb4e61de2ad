use kube::CustomResourceExt;
use multiclusterhub_operator_apis::MultiClusterHub;
use serde_yaml;

pub fn main() {
    println!("{}", serde_yaml::to_string(&MultiClusterHub::crd()).unwrap());
}
