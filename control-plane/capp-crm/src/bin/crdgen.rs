use capp_crm::crd::capp::Capp;
use kube::core::CustomResourceExt;

fn main() {
    let crd = Capp::crd();
    let yaml = serde_yaml::to_string(&crd).expect("serialize CRD to YAML");
    println!("{}", yaml);
}
